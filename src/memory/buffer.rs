//! Buffer handle over a page run of a shared memory arena
//!
//! A handle is plain data `{arena_id, page_start, capacity, used}` and can
//! be moved between threads and queues by value; the owning arena is
//! resolved through the process-local registry on each operation. Exactly
//! one party may hold a handle at any moment; the queue protocol enforces
//! the transfer of ownership.

use bytes::Bytes;

use crate::memory::arena::{ArenaId, SharedMemoryArena};
use crate::types::error::MemoryError;

/// Handle to a contiguous sub-region of an arena, holding one payload.
///
/// Every handle must be freed explicitly, either directly or by the queue
/// that consumes it. Dropping a live handle leaks its pages until the
/// arena itself is dropped, which logs the leak.
#[derive(Debug)]
pub struct SharedBuffer {
    owner: Option<ArenaId>,
    page_start: usize,
    capacity: usize,
    used: usize,
}

impl SharedBuffer {
    pub(crate) fn new(owner: ArenaId, page_start: usize, capacity: usize) -> Self {
        Self {
            owner: Some(owner),
            page_start,
            capacity,
            used: 0,
        }
    }

    /// Arena that issued this handle, if it has not been freed yet.
    pub fn owner_id(&self) -> Option<ArenaId> {
        self.owner
    }

    pub(crate) fn page_start(&self) -> usize {
        self.page_start
    }

    fn owner(&self) -> std::result::Result<SharedMemoryArena, MemoryError> {
        let id = self.owner.ok_or(MemoryError::StaleHandle)?;
        SharedMemoryArena::lookup(id)
    }

    /// Store `data` in this buffer.
    ///
    /// Fails with `AlreadyWritten` when the buffer holds data and
    /// `allow_override` is not set, and with `BufferTooSmall` when the data
    /// does not fit the capacity.
    pub fn put(&mut self, data: &[u8], allow_override: bool) -> std::result::Result<(), MemoryError> {
        if self.used > 0 && !allow_override {
            return Err(MemoryError::AlreadyWritten);
        }
        if data.len() > self.capacity {
            return Err(MemoryError::BufferTooSmall {
                data: data.len(),
                capacity: self.capacity,
            });
        }
        let arena = self.owner()?;
        arena.put_bytes(self, data)?;
        self.used = data.len();
        Ok(())
    }

    /// Store `head` immediately followed by `tail`, as one logical write.
    pub(crate) fn put_pair(
        &mut self,
        head: &[u8],
        tail: &[u8],
        allow_override: bool,
    ) -> std::result::Result<(), MemoryError> {
        let total = head.len() + tail.len();
        if self.used > 0 && !allow_override {
            return Err(MemoryError::AlreadyWritten);
        }
        if total > self.capacity {
            return Err(MemoryError::BufferTooSmall {
                data: total,
                capacity: self.capacity,
            });
        }
        let arena = self.owner()?;
        arena.write_at(self, 0, head)?;
        arena.write_at(self, head.len(), tail)?;
        self.used = total;
        Ok(())
    }

    /// Read stored data.
    ///
    /// A negative `offset` is taken relative to the used end, which is how
    /// trailing metadata sections packed after the payload are extracted.
    /// `size` defaults to the used size. Returns `None` when nothing has
    /// been stored.
    pub fn get(
        &self,
        offset: isize,
        size: Option<usize>,
    ) -> std::result::Result<Option<Bytes>, MemoryError> {
        if self.used == 0 {
            return Ok(None);
        }
        let resolved = if offset < 0 {
            self.used
                .checked_sub(offset.unsigned_abs())
                .ok_or(MemoryError::ReadOutOfBounds {
                    offset: 0,
                    size: offset.unsigned_abs(),
                    capacity: self.capacity,
                })?
        } else {
            offset as usize
        };
        let size = size.unwrap_or(self.used);
        if resolved + size > self.capacity {
            return Err(MemoryError::ReadOutOfBounds {
                offset: resolved,
                size,
                capacity: self.capacity,
            });
        }
        let arena = self.owner()?;
        Ok(Some(arena.get_bytes(self, resolved, size)?))
    }

    /// Bytes of used memory.
    pub fn size(&self) -> usize {
        self.used
    }

    /// Shrink or grow the used size without touching the stored bytes.
    pub fn resize(&mut self, used: usize) -> std::result::Result<(), MemoryError> {
        if used > self.capacity {
            return Err(MemoryError::BufferTooSmall {
                data: used,
                capacity: self.capacity,
            });
        }
        self.used = used;
        Ok(())
    }

    /// Bytes of allocated memory.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the pages to the owning arena.
    ///
    /// The first call frees the pages and returns `Ok(true)`; further calls
    /// on the same handle are no-ops returning `Ok(false)`.
    pub fn free(&mut self) -> std::result::Result<bool, MemoryError> {
        let Some(id) = self.owner else {
            return Ok(false);
        };
        let arena = SharedMemoryArena::lookup(id)?;
        arena.free(self)?;
        Ok(true)
    }

    pub(crate) fn clear(&mut self) {
        self.owner = None;
        self.capacity = 0;
        self.page_start = 0;
        self.used = 0;
    }
}

impl std::fmt::Display for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.owner {
            Some(id) => write!(
                f,
                "buffer{{arena:{}, page:{}, used:{}/{}}}",
                id, self.page_start, self.used, self.capacity
            ),
            None => write!(f, "buffer{{freed}}"),
        }
    }
}
