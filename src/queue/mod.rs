//! Cross-worker FIFO delivery built on the shared memory arena

mod shared_queue;

pub use shared_queue::{Element, Payload, SharedQueue};
