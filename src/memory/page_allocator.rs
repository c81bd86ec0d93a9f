//! Page-granular allocator over a fixed byte region
//!
//! The allocator state lives inside the managed region itself so that any
//! process mapping the region observes the same header and bitmap: a
//! 12-byte header `{magic, alloc_cursor, pages_in_use}` followed by one
//! ASCII status byte per page (`'0'` free, `'1'` used). The header and
//! bitmap occupy the first pages of the region and are marked used.
//!
//! Allocation scans forward from the cursor and rotates back to the first
//! allocatable page when no run fits in the tail. It does not coalesce
//! across the wrap boundary: a run never wraps, so a request larger than
//! every linear run of free pages fails even when the total free count
//! would cover it. Fragmentation stays bounded because buffers in a
//! streaming pipeline have short, uniform lifetimes.

use crate::constants::{ALLOCATOR_HEADER_BYTES, ALLOCATOR_MAGIC};
use crate::types::error::MemoryError;

const FREE: u8 = b'0';
const USED: u8 = b'1';

/// Allocator over a raw region; callers serialize access with a lock.
pub(crate) struct PageAllocator {
    base: *mut u8,
    total_pages: usize,
    page_size: usize,
    header_pages: usize,
    header_bytes: usize,
}

// The raw pointer targets a mapping owned by the enclosing arena, which
// outlives the allocator and guards all calls with its mutex.
unsafe impl Send for PageAllocator {}

impl PageAllocator {
    /// Initialize allocator state inside `base[0..total_pages * page_size]`.
    pub(crate) fn new(base: *mut u8, total_pages: usize, page_size: usize) -> Self {
        let header_pages = (total_pages + ALLOCATOR_HEADER_BYTES).div_ceil(page_size);
        assert!(
            header_pages < total_pages,
            "region of {} pages x {} bytes cannot hold its own allocator header",
            total_pages,
            page_size
        );

        let alloc = Self {
            base,
            total_pages,
            page_size,
            header_pages,
            header_bytes: header_pages * page_size,
        };
        alloc.reset();
        alloc
    }

    fn reset(&self) {
        self.write_header(self.header_pages as u32, self.header_pages as u32);
        self.set_status(0, self.header_pages, USED);
        self.set_status(self.header_pages, self.total_pages - self.header_pages, FREE);
    }

    fn write_header(&self, cursor: u32, used: u32) {
        let mut header = [0u8; ALLOCATOR_HEADER_BYTES];
        header[0..4].copy_from_slice(&ALLOCATOR_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&cursor.to_le_bytes());
        header[8..12].copy_from_slice(&used.to_le_bytes());
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), self.base, ALLOCATOR_HEADER_BYTES);
        }
    }

    fn set_alloc_info(&self, cursor: usize, used: usize) {
        let words = [(cursor as u32).to_le_bytes(), (used as u32).to_le_bytes()];
        unsafe {
            std::ptr::copy_nonoverlapping(words[0].as_ptr(), self.base.add(4), 4);
            std::ptr::copy_nonoverlapping(words[1].as_ptr(), self.base.add(8), 4);
        }
    }

    /// Read `(alloc_cursor, pages_in_use)`, panicking on header corruption.
    pub(crate) fn header(&self) -> (usize, usize) {
        let mut raw = [0u8; ALLOCATOR_HEADER_BYTES];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base, raw.as_mut_ptr(), ALLOCATOR_HEADER_BYTES);
        }
        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        assert_eq!(
            magic, ALLOCATOR_MAGIC,
            "allocator header corrupted: bad magic {magic:#x} in shared region"
        );
        let cursor = u32::from_le_bytes(raw[4..8].try_into().unwrap()) as usize;
        let used = u32::from_le_bytes(raw[8..12].try_into().unwrap()) as usize;
        (cursor, used)
    }

    fn set_status(&self, start: usize, page_num: usize, status: u8) {
        let begin = ALLOCATOR_HEADER_BYTES + start;
        let end = begin + page_num;
        assert!(
            end <= self.header_bytes,
            "bitmap range [{begin}..{end}) exceeds header region of {} bytes",
            self.header_bytes
        );
        unsafe {
            std::ptr::write_bytes(self.base.add(begin), status, page_num);
        }
    }

    /// Count free pages inside `[start, start + page_num)`.
    fn free_in_run(&self, start: usize, page_num: usize) -> usize {
        let begin = ALLOCATOR_HEADER_BYTES + start;
        let end = begin + page_num;
        assert!(
            end <= self.header_bytes,
            "bitmap range [{begin}..{end}) exceeds header region of {} bytes",
            self.header_bytes
        );
        let slice = unsafe { std::slice::from_raw_parts(self.base.add(begin), page_num) };
        slice.iter().filter(|&&b| b == FREE).count()
    }

    /// Find the first fully free run of `page_num` pages in
    /// `[begin, end)`. Runs never extend past `end`, so nothing is
    /// stitched across a range boundary.
    fn scan_range(&self, begin: usize, end: usize, page_num: usize) -> Option<usize> {
        if begin + page_num > end {
            return None;
        }
        let bitmap = unsafe {
            std::slice::from_raw_parts(
                self.base.add(ALLOCATOR_HEADER_BYTES + begin),
                end - begin,
            )
        };
        let mut run = 0;
        for (i, &status) in bitmap.iter().enumerate() {
            if status == FREE {
                run += 1;
                if run == page_num {
                    return Some(begin + i + 1 - page_num);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Allocate a contiguous run of `page_num` free pages.
    ///
    /// The scan starts at the cursor and walks toward the tail; when no
    /// run fits there it rotates back to the first allocatable page and
    /// walks forward once more. Runs are never stitched across the wrap
    /// boundary, so a request larger than every linear run fails with
    /// `OutOfMemory` even when the total free count would cover it.
    pub(crate) fn malloc_pages(&self, page_num: usize) -> Result<usize, MemoryError> {
        let (cursor, used) = self.header();
        let cursor = cursor.clamp(self.header_pages, self.total_pages);

        let found = self
            .scan_range(cursor, self.total_pages, page_num)
            .or_else(|| self.scan_range(self.header_pages, self.total_pages, page_num));
        let Some(pos) = found else {
            let free = self.total_pages - used;
            let detail = if free == 0 {
                format!("all pages in use: {self}")
            } else {
                format!("no contiguous free run of {page_num} pages: {self}")
            };
            tracing::warn!("failed to malloc {} pages: {}", page_num, detail);
            return Err(MemoryError::OutOfMemory {
                requested: page_num,
                free,
                detail,
            });
        };

        self.set_status(pos, page_num, USED);
        self.set_alloc_info(pos + page_num, used + page_num);
        Ok(pos)
    }

    /// Free the run `[start, start + page_num)`.
    pub(crate) fn free_pages(&self, start: usize, page_num: usize) -> Result<(), MemoryError> {
        let end = start + page_num;
        if end > self.total_pages || self.free_in_run(start, page_num) != 0 {
            return Err(MemoryError::InvalidFree { start, end });
        }
        self.set_status(start, page_num, FREE);
        let (cursor, used) = self.header();
        self.set_alloc_info(cursor, used - page_num);
        Ok(())
    }

    /// Pages currently allocated, header pages included.
    pub(crate) fn pages_in_use(&self) -> usize {
        self.header().1
    }

    /// All allocatable pages are free.
    pub(crate) fn is_empty(&self) -> bool {
        self.pages_in_use() == self.header_pages
    }

    /// All pages, header included, are allocated.
    pub(crate) fn is_full(&self) -> bool {
        self.pages_in_use() == self.total_pages
    }

    /// Pages reserved for the header and bitmap.
    pub(crate) fn header_pages(&self) -> usize {
        self.header_pages
    }

    /// Count of `'1'` bytes in the bitmap; must equal `pages_in_use`.
    #[cfg(test)]
    pub(crate) fn bitmap_used(&self) -> usize {
        let slice = unsafe {
            std::slice::from_raw_parts(self.base.add(ALLOCATOR_HEADER_BYTES), self.total_pages)
        };
        slice.iter().filter(|&&b| b == USED).count()
    }
}

impl std::fmt::Display for PageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (cursor, used) = self.header();
        write!(
            f,
            "pages[total:{}, used:{}, header:{}, cursor:{}, page_size:{}]",
            self.total_pages, used, self.header_pages, cursor, self.page_size
        )
    }
}
