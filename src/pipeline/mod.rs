//! Declarative transformation pipeline compiled into a lazy reader
//!
//! Stages are appended in declaration order and compiled by
//! [`Pipeline::transform`] into a restartable iterator factory. The
//! consumer's pull drives production lazily through every stage.

mod shuffle;
pub mod stage;
mod transform;
mod xmap;

pub use stage::{
    Reader, ReaderFactory, ReaderMapper, RecordMapper, RecordPredicate, WorkerMode, XmapConfig,
};
pub use transform::{chain_readers, SyncReader};

use std::sync::Arc;

use crate::pipeline::stage::Stage;
use crate::types::error::PipelineError;
use crate::types::{Item, Result};

/// An ordered chain of transformation stages over a sample reader.
///
/// The pipeline itself is a builder; nothing runs until the compiled
/// reader is iterated. `reset` restores the initial, stage-free state so
/// the same value can be reconfigured and reused.
#[derive(Clone, Default)]
pub struct Pipeline {
    reader: Option<ReaderFactory>,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// An empty pipeline with no default reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty pipeline over a default source reader.
    pub fn with_reader(reader: ReaderFactory) -> Self {
        Self {
            reader: Some(reader),
            stages: Vec::new(),
        }
    }

    /// Drop all stages; with `Some(reader)` also replace the source.
    pub fn reset(&mut self, reader: Option<ReaderFactory>) -> &mut Self {
        if let Some(reader) = reader {
            self.reader = Some(reader);
        }
        self.stages.clear();
        self
    }

    /// Shuffle within a window of `window` samples.
    ///
    /// Zero is a no-op, negative shuffles the entire stream.
    pub fn shuffle(&mut self, window: i64) -> &mut Self {
        if window != 0 {
            self.stages.push(Stage::Shuffle { window });
        }
        self
    }

    /// Group samples into batches of `size`, dropping a partial final
    /// batch when `drop_partial` is set.
    pub fn batch(&mut self, size: usize, drop_partial: bool) -> &mut Self {
        self.stages.push(Stage::Batch { size, drop_partial });
        self
    }

    /// Apply `mapper` to every record.
    pub fn map(&mut self, mapper: RecordMapper) -> &mut Self {
        self.stages.push(Stage::MapRecord { mapper });
        self
    }

    /// Apply `mapper` to the whole reader instead of per record.
    pub fn map_reader(&mut self, mapper: ReaderMapper) -> &mut Self {
        self.stages.push(Stage::MapReader { mapper });
        self
    }

    /// Keep only records for which `pred` holds.
    pub fn filter(&mut self, pred: RecordPredicate) -> &mut Self {
        self.stages.push(Stage::Filter { pred });
        self
    }

    /// Prefetch up to `size` records on a background thread.
    pub fn buffered(&mut self, size: usize) -> &mut Self {
        self.stages.push(Stage::Buffered { size });
        self
    }

    /// Record the first pass in memory and replay it on later passes.
    pub fn cache(&mut self) -> &mut Self {
        self.stages.push(Stage::Cache);
        self
    }

    /// Map records concurrently on a worker pool.
    ///
    /// The configuration is validated here; a zero worker count or an
    /// oversized pre-feed is rejected at construction.
    pub fn xmap(&mut self, config: XmapConfig) -> Result<&mut Self> {
        config.validate()?;
        self.stages.push(Stage::Xmap { config });
        Ok(self)
    }

    /// Append a concurrent stage applying an operator chain.
    ///
    /// Operators with accelerated plans run through `executor`; the rest
    /// chain into a generic mapper.
    pub fn map_ops(
        &mut self,
        ops: Vec<Arc<dyn crate::operators::Operator>>,
        executor: Option<Arc<dyn crate::operators::PlanExecutor>>,
        settings: crate::operators::ConcurrencySettings,
    ) -> Result<&mut Self> {
        let config = crate::operators::build_concurrent(ops, executor, settings)?;
        self.xmap(config)
    }

    /// Compile the stage chain over `reader` into a restartable factory.
    ///
    /// With `infinite`, the compiled reader restarts from the beginning
    /// after every natural end-of-stream. Errors are logged and re-raised
    /// to the consumer; after one the reader is closed.
    pub fn transform(&self, reader: ReaderFactory, infinite: bool) -> Result<ReaderFactory> {
        let mut rd = reader;
        for stage in &self.stages {
            rd = match stage {
                Stage::Shuffle { window } => shuffle::shuffle_reader(rd, *window),
                Stage::Batch { size, drop_partial } => {
                    if *size == 0 {
                        return Err(PipelineError::InvalidArgument(
                            "batch size must be positive".into(),
                        )
                        .into());
                    }
                    transform::batch_reader(rd, *size, *drop_partial)
                }
                Stage::MapRecord { mapper } => transform::map_record_reader(rd, mapper.clone()),
                Stage::MapReader { mapper } => mapper(rd),
                Stage::Filter { pred } => transform::filter_reader(rd, pred.clone()),
                Stage::Buffered { size } => {
                    if *size == 0 {
                        return Err(PipelineError::InvalidArgument(
                            "buffered size must be positive".into(),
                        )
                        .into());
                    }
                    transform::buffered_reader(rd, *size)
                }
                Stage::Cache => transform::cache_reader(rd),
                Stage::Xmap { config } => xmap::xmap_reader(rd, config.clone()),
            };
        }

        Ok(Arc::new(move || {
            Box::new(GuardIter {
                factory: rd.clone(),
                inner: Some(rd()),
                infinite,
                closed: false,
            })
        }))
    }

    /// Compile over the pipeline's own reader.
    pub fn reader(&self, infinite: bool) -> Result<ReaderFactory> {
        let reader = self.reader.clone().ok_or_else(|| {
            PipelineError::InvalidArgument("pipeline has no source reader".into())
        })?;
        self.transform(reader, infinite)
    }

    /// Compile into a thread-safe reader shareable across worker threads.
    pub fn shared_reader(&self, infinite: bool) -> Result<SyncReader> {
        let factory = self.reader(infinite)?;
        Ok(SyncReader::new(factory()))
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pipeline:")?;
        if self.stages.is_empty() {
            return write!(f, "  empty");
        }
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "  {{id:{i}, op:{stage}}}")?;
        }
        Ok(())
    }
}

/// Top-level guard: logs failures, closes after the first one, and loops
/// the underlying reader when running infinitely.
struct GuardIter {
    factory: ReaderFactory,
    inner: Option<Reader>,
    infinite: bool,
    closed: bool,
}

impl Iterator for GuardIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        loop {
            let inner = self.inner.as_mut()?;
            match inner.next() {
                Some(Ok(item)) => return Some(Ok(item)),
                Some(Err(e)) => {
                    tracing::warn!("pipeline failed: {}", e);
                    self.closed = true;
                    self.inner = None;
                    return Some(Err(e));
                }
                None => {
                    if self.infinite {
                        self.inner = Some((self.factory)());
                    } else {
                        self.inner = None;
                        return None;
                    }
                }
            }
        }
    }
}
