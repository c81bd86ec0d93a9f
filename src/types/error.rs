//! Error types and handling for the visfeed pipeline
//!
//! All failure modes form a closed set of tagged variants. Worker
//! diagnostics cross the worker boundary as formatted text so the consumer
//! sees the original failure verbatim.

use thiserror::Error;

use crate::memory::ArenaId;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the visfeed pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Shared memory allocation or buffer-lifecycle errors
    #[error("shared memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Shared queue protocol errors
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Data source errors
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Pipeline construction and execution errors
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Arena and buffer lifecycle errors
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The arena cannot satisfy an allocation
    #[error("out of memory: requested {requested} pages with {free} free ({detail})")]
    OutOfMemory {
        /// Pages requested, after rounding up to the page multiple
        requested: usize,
        /// Allocatable pages currently free
        free: usize,
        /// Allocator state summary at the time of failure
        detail: String,
    },

    /// Freeing a page run that is not fully allocated
    #[error("invalid free: page run [{start}..{end}) is not fully allocated")]
    InvalidFree {
        /// First page of the run
        start: usize,
        /// One past the last page of the run
        end: usize,
    },

    /// Freeing a buffer through an arena that did not issue it
    #[error("buffer owned by arena {owner} cannot be freed through arena {this}")]
    CrossArenaFree {
        /// Arena that issued the buffer
        owner: ArenaId,
        /// Arena the free was attempted on
        this: ArenaId,
    },

    /// Writing more bytes than the buffer holds
    #[error("data of {data} bytes exceeds buffer capacity of {capacity}")]
    BufferTooSmall {
        /// Bytes the caller tried to store
        data: usize,
        /// Capacity of the target buffer
        capacity: usize,
    },

    /// Writing a buffer that already holds data without requesting override
    #[error("buffer already written; pass allow_override to replace its contents")]
    AlreadyWritten,

    /// Resolving a handle whose arena is gone from this process
    #[error("arena {0} is not registered in this process")]
    UnknownArena(ArenaId),

    /// Operating on a handle that was already freed
    #[error("buffer handle is empty (already freed)")]
    StaleHandle,

    /// Range check failure on a buffer read
    #[error("read of [{offset}..{offset}+{size}) exceeds buffer capacity {capacity}")]
    ReadOutOfBounds {
        /// Requested start offset, already resolved against the used size
        offset: usize,
        /// Requested read length
        size: usize,
        /// Capacity of the buffer
        capacity: usize,
    },
}

/// Shared queue protocol errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Serialized metadata exceeds the compile-time cap
    #[error("serialized metadata of {size} bytes exceeds the cap of {cap}")]
    MetadataTooLarge {
        /// Actual serialized size
        size: usize,
        /// Compile-time cap
        cap: usize,
    },

    /// All peers of the underlying channel are gone
    #[error("queue disconnected")]
    Disconnected,

    /// A dequeued element violated the wire protocol
    #[error("queue protocol violation: {0}")]
    Protocol(String),

    /// A dequeued data element carried no stored bytes
    #[error("no data stored in the dequeued buffer")]
    EmptyBuffer,

    /// Metadata failed to serialize
    #[error("metadata encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Metadata failed to deserialize
    #[error("metadata decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Data source errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// URI scheme the core does not open
    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),

    /// The requested partition holds no files
    #[error("partition {part_id}/{part_count} of {uri} holds no files")]
    EmptyPartition {
        /// Source location
        uri: String,
        /// Partition requested
        part_id: usize,
        /// Total partitions
        part_count: usize,
    },

    /// A record could not be decoded from a file
    #[error("malformed record in {file}: {detail}")]
    BadRecord {
        /// File the record came from
        file: String,
        /// What went wrong
        detail: String,
    },
}

/// Pipeline construction and execution errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid stage parameter or unusable configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A worker's mapper failed; carries the worker diagnostic verbatim
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// The order-preserving side-map exceeded its bound
    #[error("ordered results exceeded the side-map bound of {bound}")]
    OrderingFailure {
        /// Maximum buffered out-of-order results allowed
        bound: usize,
    },
}
