//! Configuration for reader assembly
//!
//! Scalar settings for sources and pipelines, loadable from TOML. Mappers
//! and operators are code and plug in separately; everything sizeable or
//! switchable lives here.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ARENA_BYTES, DEFAULT_PAGE_BYTES, DEFAULT_XMAP_BUFFER, DEFAULT_XMAP_WORKERS,
};
use crate::pipeline::{RecordMapper, WorkerMode, XmapConfig};
use crate::source::SourceConfig;
use crate::types::error::PipelineError;
use crate::types::Result;

/// Scalar settings of a concurrent map stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct XmapSettings {
    /// Number of workers.
    pub worker_count: usize,
    /// Bound on in-flight samples.
    pub buffer_size: usize,
    /// Worker execution mode.
    pub mode: WorkerMode,
    /// Samples fed before the first result is awaited.
    pub pre_feed: Option<usize>,
    /// Yield results in feed order.
    pub preserve_order: bool,
    /// Arena capacity for shared-memory mode.
    pub shared_mem_bytes: usize,
    /// Arena page size for shared-memory mode.
    pub page_bytes: usize,
}

impl Default for XmapSettings {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_XMAP_WORKERS,
            buffer_size: DEFAULT_XMAP_BUFFER,
            mode: WorkerMode::InProcess,
            pre_feed: None,
            preserve_order: false,
            shared_mem_bytes: DEFAULT_ARENA_BYTES,
            page_bytes: DEFAULT_PAGE_BYTES,
        }
    }
}

impl XmapSettings {
    /// Attach a mapper, producing a full stage configuration.
    pub fn into_config(self, mapper: RecordMapper) -> XmapConfig {
        let mut cfg = XmapConfig::new(mapper)
            .workers(self.worker_count)
            .buffer(self.buffer_size)
            .mode(self.mode)
            .ordered(self.preserve_order)
            .shared_mem(self.shared_mem_bytes, self.page_bytes);
        if let Some(pre) = self.pre_feed {
            cfg = cfg.pre_feed(pre);
        }
        cfg
    }
}

/// Scalar settings of a transformation pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Shuffle window; zero disables, negative shuffles the whole stream.
    pub shuffle_window: i64,
    /// Samples per batch; zero disables batching.
    pub batch_size: usize,
    /// Drop a partial final batch.
    pub drop_partial: bool,
    /// Concurrent map sizing.
    pub xmap: XmapSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shuffle_window: 1024,
            batch_size: 32,
            drop_partial: false,
            xmap: XmapSettings::default(),
        }
    }
}

/// Top-level configuration: where to read and how to transform.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Source settings.
    pub source: SourceConfig,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<ReaderConfig> {
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw)
        .map_err(|e| PipelineError::InvalidArgument(format!("bad config {path}: {e}")).into())
}

/// Load configuration from a TOML file, falling back to defaults.
pub fn load_config_or_default(path: Option<&str>) -> ReaderConfig {
    match path {
        Some(path) => match load_config(path) {
            Ok(config) => {
                tracing::info!("loaded configuration from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("failed to load config from {}: {}; using defaults", path, e);
                ReaderConfig::default()
            }
        },
        None => {
            tracing::info!("no config file specified, using defaults");
            ReaderConfig::default()
        }
    }
}
