//! Type definitions shared across the crate

/// Error types and the crate-wide `Result` alias
pub mod error;

/// Sample and pipeline item types
pub mod sample;

pub use error::{Error, MemoryError, PipelineError, QueueError, Result, SourceError};
pub use sample::{Item, Sample, Tag};
