//! Stage descriptors and the function types that plug into them
//!
//! A pipeline is an ordered list of these descriptors; the interpreter in
//! the pipeline module compiles them into a lazy reader. User code plugs
//! in through the opaque record-mapper and predicate variants.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ARENA_BYTES, DEFAULT_PAGE_BYTES, DEFAULT_XMAP_BUFFER, DEFAULT_XMAP_WORKERS,
    WORKER_JOIN_TIMEOUT_S,
};
use crate::types::error::PipelineError;
use crate::types::{Item, Result, Sample};

/// Pure mapping from sample to sample, applied per record.
pub type RecordMapper = Arc<dyn Fn(Sample) -> Result<Sample> + Send + Sync>;

/// Predicate deciding whether a sample passes a filter stage.
pub type RecordPredicate = Arc<dyn Fn(&Sample) -> bool + Send + Sync>;

/// A lazy iterator over pipeline items.
pub type Reader = Box<dyn Iterator<Item = Result<Item>> + Send>;

/// Restartable iterator maker; every call opens a fresh pass.
pub type ReaderFactory = Arc<dyn Fn() -> Reader + Send + Sync>;

/// Mapping applied to a whole reader instead of per record.
pub type ReaderMapper = Arc<dyn Fn(ReaderFactory) -> ReaderFactory + Send + Sync>;

/// How a concurrent map stage runs its workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Worker threads exchanging samples over in-memory bounded channels.
    InProcess,
    /// Worker threads exchanging payloads through shared-memory queues,
    /// keeping large payload bytes out of the channel itself.
    SharedMem,
}

/// Configuration of a concurrent map stage.
#[derive(Clone)]
pub struct XmapConfig {
    /// The mapper every worker applies.
    pub mapper: RecordMapper,
    /// Number of workers.
    pub worker_count: usize,
    /// Bound on in-flight samples for both the in- and out-queue.
    pub buffer_size: usize,
    /// Worker execution mode.
    pub mode: WorkerMode,
    /// Samples fed before the first result is awaited; defaults to
    /// `buffer_size / 2 + 1` (rounded up) and may not exceed `buffer_size`.
    pub pre_feed: Option<usize>,
    /// Yield results in feed order.
    pub preserve_order: bool,
    /// Arena capacity for shared-memory mode.
    pub shared_mem_bytes: usize,
    /// Arena page size for shared-memory mode.
    pub page_bytes: usize,
    /// How long to wait per worker on teardown before abandoning the join.
    pub join_timeout: Duration,
}

impl XmapConfig {
    /// Configuration with default sizing around `mapper`.
    pub fn new(mapper: RecordMapper) -> Self {
        Self {
            mapper,
            worker_count: DEFAULT_XMAP_WORKERS,
            buffer_size: DEFAULT_XMAP_BUFFER,
            mode: WorkerMode::InProcess,
            pre_feed: None,
            preserve_order: false,
            shared_mem_bytes: DEFAULT_ARENA_BYTES,
            page_bytes: DEFAULT_PAGE_BYTES,
            join_timeout: Duration::from_secs(WORKER_JOIN_TIMEOUT_S),
        }
    }

    /// Set the worker count.
    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the in-flight bound.
    pub fn buffer(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the worker mode.
    pub fn mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set an explicit pre-feed count.
    pub fn pre_feed(mut self, count: usize) -> Self {
        self.pre_feed = Some(count);
        self
    }

    /// Keep output order equal to input order.
    pub fn ordered(mut self, yes: bool) -> Self {
        self.preserve_order = yes;
        self
    }

    /// Size the shared-memory arena used in [`WorkerMode::SharedMem`].
    pub fn shared_mem(mut self, bytes: usize, page_bytes: usize) -> Self {
        self.shared_mem_bytes = bytes;
        self.page_bytes = page_bytes;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(PipelineError::InvalidArgument(
                "xmap requires at least one worker".into(),
            )
            .into());
        }
        if self.buffer_size == 0 {
            return Err(PipelineError::InvalidArgument(
                "xmap requires a positive buffer size".into(),
            )
            .into());
        }
        if let Some(pre) = self.pre_feed {
            if pre == 0 || pre > self.buffer_size {
                return Err(PipelineError::InvalidArgument(format!(
                    "pre_feed {pre} must be in 1..=buffer_size ({})",
                    self.buffer_size
                ))
                .into());
            }
        }
        Ok(())
    }

    pub(crate) fn effective_pre_feed(&self) -> usize {
        self.pre_feed
            .unwrap_or(self.buffer_size.div_ceil(2) + 1)
            .min(self.buffer_size)
    }
}

/// One transformation in a pipeline.
#[derive(Clone)]
pub(crate) enum Stage {
    Shuffle { window: i64 },
    Batch { size: usize, drop_partial: bool },
    MapRecord { mapper: RecordMapper },
    MapReader { mapper: ReaderMapper },
    Filter { pred: RecordPredicate },
    Buffered { size: usize },
    Cache,
    Xmap { config: XmapConfig },
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Shuffle { window } => write!(f, "shuffle(window:{window})"),
            Stage::Batch { size, drop_partial } => {
                write!(f, "batch(size:{size}, drop:{drop_partial})")
            }
            Stage::MapRecord { .. } => write!(f, "map(record)"),
            Stage::MapReader { .. } => write!(f, "map(reader)"),
            Stage::Filter { .. } => write!(f, "filter"),
            Stage::Buffered { size } => write!(f, "buffered(size:{size})"),
            Stage::Cache => write!(f, "cache(memory)"),
            Stage::Xmap { config } => write!(
                f,
                "xmap(workers:{}, buffer:{}, mode:{:?}, ordered:{})",
                config.worker_count, config.buffer_size, config.mode, config.preserve_order
            ),
        }
    }
}
