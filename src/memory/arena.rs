//! Shared memory arena: a fixed byte region with page-granular allocation
//!
//! The backing region is a `MAP_SHARED` mapping of an unlinked temporary
//! file, so the mapping is inheritable by child processes while vanishing
//! from the filesystem immediately. Allocator state (header and bitmap)
//! lives inside the region; every process mapping it sees the same state.
//!
//! Arenas are discoverable process-locally through a registry keyed by
//! [`ArenaId`], letting a consumer that receives a buffer handle resolve it
//! back to the local mapping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::constants::{DEFAULT_ARENA_BYTES, DEFAULT_PAGE_BYTES};
use crate::memory::buffer::SharedBuffer;
use crate::memory::page_allocator::PageAllocator;
use crate::types::error::{MemoryError, PipelineError};
use crate::types::Result;

/// Process-wide table of live arenas, weakly held so arena lifetime stays
/// with the owning pipeline.
static ARENAS: Lazy<DashMap<ArenaId, Weak<ArenaCore>>> = Lazy::new(DashMap::new);

static ARENA_SEQ: AtomicU32 = AtomicU32::new(0);

/// Identity of an arena: owning pid plus a per-process counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ArenaId {
    pid: u32,
    seq: u32,
}

impl ArenaId {
    fn next() -> Self {
        Self {
            pid: std::process::id(),
            seq: ARENA_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for ArenaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.pid, self.seq)
    }
}

struct ArenaCore {
    id: ArenaId,
    capacity: usize,
    page_size: usize,
    total_pages: usize,
    base: *mut u8,
    allocator: Mutex<PageAllocator>,
    released: AtomicBool,
    // Held only to keep the mapping alive until drop.
    _map: MmapMut,
}

// `base` points into the mapping owned by this struct; bitmap and header
// mutation goes through the allocator mutex, bulk copies target disjoint
// page runs owned by exactly one party at a time.
unsafe impl Send for ArenaCore {}
unsafe impl Sync for ArenaCore {}

impl Drop for ArenaCore {
    fn drop(&mut self) {
        ARENAS.remove(&self.id);
        let leaked = {
            let alloc = self.allocator.lock();
            if alloc.is_empty() {
                0
            } else {
                alloc.pages_in_use() - alloc.header_pages()
            }
        };
        if leaked > 0 {
            if self.released.load(Ordering::Relaxed) {
                tracing::debug!("arena {} released with {} pages still allocated", self.id, leaked);
            } else {
                tracing::warn!("arena {} dropped with {} pages still allocated", self.id, leaked);
            }
        }
    }
}

/// Owner of a contiguous shared byte region, allocated in pages.
///
/// Cloning is cheap and shares the region; the region is unmapped when the
/// last clone drops.
#[derive(Clone)]
pub struct SharedMemoryArena {
    core: Arc<ArenaCore>,
}

impl SharedMemoryArena {
    /// Create an arena with the default 1 GiB capacity and 64 KiB pages.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_ARENA_BYTES, DEFAULT_PAGE_BYTES)
    }

    /// Create an arena of `capacity` bytes split into `page_size` pages.
    ///
    /// `capacity` must be a positive multiple of `page_size`; both are
    /// fixed for the arena's lifetime.
    pub fn with_capacity(capacity: usize, page_size: usize) -> Result<Self> {
        if capacity == 0 || page_size == 0 || capacity % page_size != 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "arena capacity {capacity} is not a positive multiple of page size {page_size}"
            ))
            .into());
        }
        let total = capacity / page_size;
        let header = (total + crate::constants::ALLOCATOR_HEADER_BYTES).div_ceil(page_size);
        if header >= total {
            return Err(PipelineError::InvalidArgument(format!(
                "arena of {total} pages x {page_size} bytes cannot hold its allocator header"
            ))
            .into());
        }

        let file = tempfile::tempfile()?;
        file.set_len(capacity as u64)?;
        let mut map = unsafe { MmapOptions::new().len(capacity).map_mut(&file)? };
        let base = map.as_mut_ptr();

        let total_pages = capacity / page_size;
        let allocator = PageAllocator::new(base, total_pages, page_size);

        let id = ArenaId::next();
        let core = Arc::new(ArenaCore {
            id,
            capacity,
            page_size,
            total_pages,
            base,
            allocator: Mutex::new(allocator),
            released: AtomicBool::new(false),
            _map: map,
        });
        ARENAS.insert(id, Arc::downgrade(&core));
        tracing::debug!(
            "created arena {} with {} pages of {} bytes",
            id,
            total_pages,
            page_size
        );
        Ok(Self { core })
    }

    /// Resolve an arena id to the mapping registered in this process.
    pub fn lookup(id: ArenaId) -> std::result::Result<Self, MemoryError> {
        ARENAS
            .get(&id)
            .and_then(|weak| weak.upgrade())
            .map(|core| Self { core })
            .ok_or(MemoryError::UnknownArena(id))
    }

    /// Identity of this arena.
    pub fn id(&self) -> ArenaId {
        self.core.id
    }

    /// Region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Allocation unit in bytes.
    pub fn page_size(&self) -> usize {
        self.core.page_size
    }

    /// Bytes available to allocations on an empty arena, i.e. the capacity
    /// minus the pages claimed by the allocator header.
    pub fn allocatable_bytes(&self) -> usize {
        (self.core.total_pages - self.core.allocator.lock().header_pages()) * self.core.page_size
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// The size is rounded up to the next page multiple and a zero-byte
    /// request still claims one page. Fails with `OutOfMemory` when no
    /// contiguous run is free at the allocation cursor.
    pub fn malloc(&self, size: usize) -> Result<SharedBuffer> {
        let page_num = (size.div_ceil(self.core.page_size)).max(1);
        let start = self.core.allocator.lock().malloc_pages(page_num)?;
        Ok(SharedBuffer::new(
            self.core.id,
            start,
            page_num * self.core.page_size,
        ))
    }

    /// Return a buffer's pages to the arena.
    ///
    /// The handle must have been issued by this arena and still be live;
    /// its fields are cleared on success. Use [`SharedBuffer::free`] when
    /// the owning arena should be resolved through the registry.
    pub fn free(&self, buffer: &mut SharedBuffer) -> std::result::Result<(), MemoryError> {
        let owner = buffer.owner_id().ok_or(MemoryError::StaleHandle)?;
        if owner != self.core.id {
            return Err(MemoryError::CrossArenaFree {
                owner,
                this: self.core.id,
            });
        }
        let page_num = buffer.capacity() / self.core.page_size;
        debug_assert_eq!(page_num * self.core.page_size, buffer.capacity());
        self.core
            .allocator
            .lock()
            .free_pages(buffer.page_start(), page_num)?;
        buffer.clear();
        Ok(())
    }

    /// Copy `data` into the region behind `buffer`, starting at its first
    /// page. Lock-free; correctness relies on the buffer being in exactly
    /// one party's possession.
    pub fn put_bytes(&self, buffer: &SharedBuffer, data: &[u8]) -> std::result::Result<(), MemoryError> {
        self.write_at(buffer, 0, data)
    }

    pub(crate) fn write_at(
        &self,
        buffer: &SharedBuffer,
        offset: usize,
        data: &[u8],
    ) -> std::result::Result<(), MemoryError> {
        if offset + data.len() > buffer.capacity() {
            return Err(MemoryError::BufferTooSmall {
                data: offset + data.len(),
                capacity: buffer.capacity(),
            });
        }
        let start = buffer.page_start() * self.core.page_size + offset;
        assert!(
            start + data.len() <= self.core.capacity,
            "buffer handle points outside arena {}",
            self.core.id
        );
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.core.base.add(start), data.len());
        }
        Ok(())
    }

    /// Copy `size` bytes out of the region behind `buffer`, starting at
    /// `offset` from its first page.
    pub fn get_bytes(
        &self,
        buffer: &SharedBuffer,
        offset: usize,
        size: usize,
    ) -> std::result::Result<Bytes, MemoryError> {
        if offset + size > buffer.capacity() {
            return Err(MemoryError::ReadOutOfBounds {
                offset,
                size,
                capacity: buffer.capacity(),
            });
        }
        let start = buffer.page_start() * self.core.page_size + offset;
        assert!(
            start + size <= self.core.capacity,
            "buffer handle points outside arena {}",
            self.core.id
        );
        let mut out = vec![0u8; size];
        unsafe {
            std::ptr::copy_nonoverlapping(self.core.base.add(start), out.as_mut_ptr(), size);
        }
        Ok(Bytes::from(out))
    }

    /// Pages currently allocated, header pages included.
    pub fn pages_in_use(&self) -> usize {
        self.core.allocator.lock().pages_in_use()
    }

    /// All allocatable pages are free.
    pub fn is_empty(&self) -> bool {
        self.core.allocator.lock().is_empty()
    }

    /// All pages are allocated.
    pub fn is_full(&self) -> bool {
        self.core.allocator.lock().is_full()
    }

    /// Mark the arena as deliberately released; outstanding allocations at
    /// drop are then reported at debug level instead of warn.
    pub fn release(&self) {
        self.core.released.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Display for SharedMemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "arena{{id:{}, {}}}", self.core.id, self.core.allocator.lock())
    }
}
