//! Shared memory layer: page allocator, arena, and buffer handles

mod arena;
mod buffer;
mod page_allocator;

pub use arena::{ArenaId, SharedMemoryArena};
pub use buffer::SharedBuffer;
