//! # Visfeed
//!
//! High-throughput sample loading for image classification and detection
//! training loops. Raw records stream out of a partitioned on-disk corpus,
//! run through a user-defined chain of per-sample transformations spread
//! across a worker pool, and arrive at the consumer through a bounded-
//! memory pipeline. Large payloads move between workers through a
//! page-allocated shared memory arena instead of being copied through
//! channel internals.

#![warn(missing_docs)]

/// System constants
pub mod constants;

/// Core application components
pub mod core;

/// Shared memory allocator, arena and buffer handles
pub mod memory;

/// Operator interface and accelerated-plan translation
pub mod operators;

/// Transformation pipeline and concurrent map stages
pub mod pipeline;

/// Shared-memory bounded FIFO
pub mod queue;

/// Reader assembly for named recipes
pub mod reader_builder;

/// Partitioned data sources and record readers
pub mod source;

/// Type definitions shared across the crate
pub mod types;

// Re-export the types most callers touch
pub use memory::{ArenaId, SharedBuffer, SharedMemoryArena};
pub use pipeline::{Pipeline, WorkerMode, XmapConfig};
pub use queue::SharedQueue;
pub use types::{Error, Item, Result, Sample, Tag};
