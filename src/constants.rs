//! Global constants used throughout the visfeed codebase
//!
//! Compile-time defaults shared across modules so that sizing decisions
//! live in one place instead of scattered magic numbers.

/// Default capacity of a shared memory arena in bytes (1 GiB)
///
/// Large enough to keep a few thousand decoded images in flight between
/// producer and workers without the allocator cursor lapping itself.
pub const DEFAULT_ARENA_BYTES: usize = 1024 * 1024 * 1024;

/// Default allocation unit of an arena in bytes (64 KiB)
///
/// A page comfortably holds the metadata sideband plus small payloads,
/// while keeping the bitmap for a 1 GiB arena down to 16 KiB.
pub const DEFAULT_PAGE_BYTES: usize = 64 * 1024;

/// Magic value marking an initialized allocator header
pub const ALLOCATOR_MAGIC: u32 = 1_234_321;

/// Serialized allocator header size: magic, alloc cursor, pages in use
pub const ALLOCATOR_HEADER_BYTES: usize = 12;

/// Upper bound for a serialized queue metadata blob in bytes
///
/// Metadata travels inline with the buffer handle; anything larger belongs
/// in the payload region.
pub const META_BLOB_MAX: usize = 2048;

/// Default worker count for concurrent map stages
pub const DEFAULT_XMAP_WORKERS: usize = 16;

/// Default bound on in-flight samples in a concurrent map stage
pub const DEFAULT_XMAP_BUFFER: usize = 1000;

/// Seconds to wait for a worker to exit before abandoning the join
pub const WORKER_JOIN_TIMEOUT_S: u64 = 3;
