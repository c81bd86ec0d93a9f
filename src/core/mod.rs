//! Core application components

/// Configuration structures and loading helpers
pub mod config;

pub use config::{load_config, load_config_or_default, PipelineConfig, ReaderConfig, XmapSettings};
