//! Assembly of sources and pipelines into named readers
//!
//! A builder holds one [`ReaderSetting`] per reader kind and a recipe that
//! knows how to lay out the pipeline for each kind. Sources are created
//! lazily and cached, so asking for the same reader twice reuses the
//! listed and partitioned file set.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::PipelineConfig;
use crate::pipeline::{Pipeline, ReaderFactory, RecordMapper};
use crate::source::{LocalSource, SourceConfig};
use crate::types::error::PipelineError;
use crate::types::Result;

/// The reader roles a training job asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReaderKind {
    /// Training reader, typically shuffled and augmented
    Train,
    /// Validation reader
    Val,
    /// Test reader
    Test,
}

impl std::fmt::Display for ReaderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderKind::Train => write!(f, "train"),
            ReaderKind::Val => write!(f, "val"),
            ReaderKind::Test => write!(f, "test"),
        }
    }
}

/// Everything needed to build one named reader.
#[derive(Clone, Debug)]
pub struct ReaderSetting {
    /// Data location; overrides the uri inside `source`.
    pub uri: String,
    /// Source settings.
    pub source: SourceConfig,
    /// Pipeline settings handed to the recipe.
    pub pipeline: PipelineConfig,
}

impl ReaderSetting {
    /// A setting over `uri` with default source and pipeline settings.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            source: SourceConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Lays out the pipeline for each reader kind.
pub trait Recipe: Send + Sync {
    /// Build the pipeline for `kind` from scalar settings.
    fn pipeline(&self, kind: ReaderKind, config: &PipelineConfig) -> Result<Pipeline>;
}

/// A generic classification recipe driven entirely by settings.
///
/// Train readers shuffle, map and batch; val and test readers skip the
/// shuffle. An optional mapper slots in between, concurrently when the
/// settings ask for workers.
pub struct ClassificationRecipe {
    mapper: Option<RecordMapper>,
}

impl ClassificationRecipe {
    /// A recipe without a per-sample mapper.
    pub fn new() -> Self {
        Self { mapper: None }
    }

    /// A recipe applying `mapper` to every sample.
    pub fn with_mapper(mapper: RecordMapper) -> Self {
        Self {
            mapper: Some(mapper),
        }
    }
}

impl Default for ClassificationRecipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Recipe for ClassificationRecipe {
    fn pipeline(&self, kind: ReaderKind, config: &PipelineConfig) -> Result<Pipeline> {
        let mut pl = Pipeline::new();
        if kind == ReaderKind::Train {
            pl.shuffle(config.shuffle_window);
        }
        if let Some(mapper) = &self.mapper {
            if config.xmap.worker_count > 1 {
                pl.xmap(config.xmap.clone().into_config(mapper.clone()))?;
            } else {
                pl.map(mapper.clone());
            }
        }
        if config.batch_size > 0 {
            pl.batch(config.batch_size, config.drop_partial);
        }
        Ok(pl)
    }
}

/// Builds and caches the `train`/`val`/`test` readers of a job.
pub struct ReaderBuilder {
    settings: HashMap<ReaderKind, ReaderSetting>,
    recipe: Box<dyn Recipe>,
    sources: HashMap<ReaderKind, Arc<LocalSource>>,
}

impl ReaderBuilder {
    /// A builder over per-kind settings and a recipe.
    pub fn new(settings: HashMap<ReaderKind, ReaderSetting>, recipe: Box<dyn Recipe>) -> Self {
        Self {
            settings,
            recipe,
            sources: HashMap::new(),
        }
    }

    /// The source for `kind`, opened on first use and cached.
    pub fn source(&mut self, kind: ReaderKind) -> Result<Arc<LocalSource>> {
        if let Some(source) = self.sources.get(&kind) {
            return Ok(source.clone());
        }
        let setting = self.setting(kind)?;
        let config = SourceConfig {
            uri: setting.uri.clone(),
            ..setting.source.clone()
        };
        let source = Arc::new(LocalSource::new(config)?);
        self.sources.insert(kind, source.clone());
        Ok(source)
    }

    fn setting(&self, kind: ReaderKind) -> Result<&ReaderSetting> {
        self.settings.get(&kind).ok_or_else(|| {
            PipelineError::InvalidArgument(format!("no reader setting for {kind}")).into()
        })
    }

    fn build(&mut self, kind: ReaderKind) -> Result<ReaderFactory> {
        let pipeline_config = self.setting(kind)?.pipeline.clone();
        let source = self.source(kind)?;
        let pipeline = self.recipe.pipeline(kind, &pipeline_config)?;
        pipeline.transform(source.reader(None), false)
    }

    /// Build the training reader.
    pub fn train(&mut self) -> Result<ReaderFactory> {
        self.build(ReaderKind::Train)
    }

    /// Build the validation reader.
    pub fn val(&mut self) -> Result<ReaderFactory> {
        self.build(ReaderKind::Val)
    }

    /// Build the test reader.
    pub fn test(&mut self) -> Result<ReaderFactory> {
        self.build(ReaderKind::Test)
    }
}
