//! Sample and item types flowing through the pipeline
//!
//! A sample couples one large binary payload with a handful of small tags.
//! Only the payload is eligible for shared-memory transfer; tags travel on
//! the serialized metadata sideband.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::error::PipelineError;

/// Small inline metadata attached to a sample: labels, ids, filenames
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Tag {
    /// Integer label or id
    Int(i64),
    /// Floating point score or weight
    Float(f64),
    /// Textual label or key
    Text(String),
    /// Small opaque bytes, e.g. a seqfile record key
    Blob(Vec<u8>),
}

/// A unit of work: binary payload plus inline tags
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The large binary blob (image bytes or a decoded tensor in bytes form)
    pub payload: Bytes,
    /// Small labels, ids, metadata
    pub tags: Vec<Tag>,
}

impl Sample {
    /// Create a sample from a payload and tags
    pub fn new(payload: impl Into<Bytes>, tags: Vec<Tag>) -> Self {
        Self {
            payload: payload.into(),
            tags,
        }
    }

    /// Create a sample carrying only a payload
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, Vec::new())
    }

    /// Payload size in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// An element yielded by a pipeline reader: a lone sample or a batch
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    /// A single sample
    Sample(Sample),
    /// A batch of samples produced by a batch stage
    Batch(Vec<Sample>),
}

impl Item {
    /// Unwrap a single sample, failing on batches
    pub fn into_sample(self) -> std::result::Result<Sample, PipelineError> {
        match self {
            Item::Sample(s) => Ok(s),
            Item::Batch(_) => Err(PipelineError::InvalidArgument(
                "expected a single sample, found a batch".into(),
            )),
        }
    }

    /// Borrow the single sample if this item is not a batch
    pub fn as_sample(&self) -> Option<&Sample> {
        match self {
            Item::Sample(s) => Some(s),
            Item::Batch(_) => None,
        }
    }
}

impl From<Sample> for Item {
    fn from(s: Sample) -> Self {
        Item::Sample(s)
    }
}
