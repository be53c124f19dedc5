//! # Page Pool
//!
//! A bounded pool of fixed-size pages carved from one contiguous anonymous
//! memory mapping. Allocation and free go through an internal lock-free
//! stack of page indices; pages never move and the pool never grows.
//!
//! ## Arena Layout
//!
//! ```text
//! base ──> ┌────────────┬────────────┬─────┬────────────┐
//!          │   page 0   │   page 1   │ ... │  page N-1  │
//!          └────────────┴────────────┴─────┴────────────┘
//!          each page `page_size` bytes, page_size a power of two
//! ```
//!
//! Because the mapping is OS-page aligned and `page_size` is a power of
//! two, every page start is 16-byte aligned; the log layer relies on this
//! for its entry grid.
//!
//! ## Reclamation Contract
//!
//! `free` is unsafe: the caller must guarantee that no thread can still
//! reach the page. Components that share pages route every free through
//! the [`crate::smr`] module, which defers the call until all epoch guards
//! that could have observed the pointer have been dropped. Pages are
//! zeroed on free, so `alloc` always hands out zeroed memory; the log's
//! slot acquisition CAS depends on that.

mod stack;

use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use eyre::{ensure, eyre, Result, WrapErr};
use memmap2::MmapMut;
use stack::FixedSizeStack;
use std::ptr::NonNull;
use std::sync::Arc;

/// Owner of the page arena. Cheap to share via `Arc`.
pub struct PageManager {
    base: NonNull<u8>,
    page_size: usize,
    pool_pages: usize,
    free_pages: FixedSizeStack,
    /// Keeps the arena mapped for the manager's lifetime.
    _arena: MmapMut,
}

// SAFETY: the arena is plain memory owned by the manager; all shared
// mutation of page contents is coordinated by the callers (log/GC) through
// atomics and SMR. The free stack is lock-free and thread-safe.
unsafe impl Send for PageManager {}
unsafe impl Sync for PageManager {}

impl PageManager {
    /// Maps an arena of `pool_pages * page_size` bytes and marks every
    /// page free.
    pub fn new(page_size: usize, pool_pages: usize) -> Result<Arc<Self>> {
        ensure!(
            page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "unsupported page size {page_size}"
        );
        ensure!(pool_pages >= 1, "pool must hold at least one page");
        ensure!(
            pool_pages <= u32::MAX as usize - 1,
            "pool of {pool_pages} pages exceeds the index range"
        );

        let mut arena = MmapMut::map_anon(page_size * pool_pages)
            .wrap_err_with(|| format!("failed to map {pool_pages} pages of {page_size} bytes"))?;
        let base =
            NonNull::new(arena.as_mut_ptr()).ok_or_else(|| eyre!("anonymous mapping is null"))?;

        let free_pages = FixedSizeStack::new(pool_pages);
        for index in (0..pool_pages as u32).rev() {
            let pushed = free_pages.push(index);
            debug_assert!(pushed);
        }

        Ok(Arc::new(Self {
            base,
            page_size,
            pool_pages,
            free_pages,
            _arena: arena,
        }))
    }

    /// Pops a free page. Returns `None` when the pool is exhausted.
    /// The returned page is zeroed.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        match self.free_pages.pop() {
            Some(index) => Some(self.page_at(index)),
            None => {
                tracing::warn!(pool_pages = self.pool_pages, "page pool exhausted");
                None
            }
        }
    }

    /// Returns a page to the pool.
    ///
    /// # Safety
    ///
    /// `page` must have been handed out by [`alloc`](Self::alloc) of this
    /// manager and no thread may still hold a reference into it. Frees of
    /// pages that were ever shared must be deferred through [`crate::smr`].
    pub unsafe fn free(&self, page: NonNull<u8>) {
        let index = self.page_index(page);
        // Zero the page so the next alloc hands out pristine memory.
        std::ptr::write_bytes(page.as_ptr(), 0, self.page_size);
        let pushed = self.free_pages.push(index);
        debug_assert!(pushed, "freed a page that was never allocated");
    }

    /// Dense index of a page within the arena.
    pub fn page_index(&self, page: NonNull<u8>) -> u32 {
        let offset = page.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert!(offset % self.page_size == 0, "pointer not at a page start");
        debug_assert!(offset / self.page_size < self.pool_pages, "pointer outside arena");
        (offset / self.page_size) as u32
    }

    /// Pointer to the page with the given index.
    pub fn page_at(&self, index: u32) -> NonNull<u8> {
        debug_assert!((index as usize) < self.pool_pages, "page index out of range");
        // SAFETY: index is within the arena, which is non-null and mapped
        // for the manager's lifetime.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.page_size)) }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pool_pages(&self) -> usize {
        self.pool_pages
    }

    /// Number of currently free pages. Approximate under concurrency.
    pub fn available(&self) -> usize {
        self.free_pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_distinct_zeroed_pages() {
        let manager = PageManager::new(4096, 4).unwrap();
        let mut pages = Vec::new();
        while let Some(page) = manager.alloc() {
            let data = unsafe { std::slice::from_raw_parts(page.as_ptr(), 4096) };
            assert!(data.iter().all(|&b| b == 0));
            pages.push(page);
        }
        assert_eq!(pages.len(), 4);
        pages.sort_by_key(|p| p.as_ptr() as usize);
        pages.dedup_by_key(|p| p.as_ptr() as usize);
        assert_eq!(pages.len(), 4, "alloc handed out the same page twice");
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let manager = PageManager::new(4096, 2);
        let manager = manager.unwrap();
        let a = manager.alloc().unwrap();
        let _b = manager.alloc().unwrap();
        assert!(manager.alloc().is_none());
        unsafe { manager.free(a) };
        assert!(manager.alloc().is_some());
    }

    #[test]
    fn freed_page_is_not_in_pool_while_allocated() {
        let manager = PageManager::new(4096, 2).unwrap();
        let page = manager.alloc().unwrap();
        assert_eq!(manager.available(), 1);
        unsafe { manager.free(page) };
        assert_eq!(manager.available(), 2);
    }

    #[test]
    fn free_zeroes_the_page() {
        let manager = PageManager::new(4096, 1).unwrap();
        let page = manager.alloc().unwrap();
        unsafe {
            std::ptr::write_bytes(page.as_ptr(), 0xAB, 4096);
            manager.free(page);
        }
        let page = manager.alloc().unwrap();
        let data = unsafe { std::slice::from_raw_parts(page.as_ptr(), 4096) };
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn index_pointer_roundtrip() {
        let manager = PageManager::new(4096, 8).unwrap();
        for index in 0..8 {
            let page = manager.page_at(index);
            assert_eq!(manager.page_index(page), index);
        }
    }

    #[test]
    fn pages_are_sixteen_byte_aligned() {
        let manager = PageManager::new(4096, 4).unwrap();
        for index in 0..4 {
            assert_eq!(manager.page_at(index).as_ptr() as usize % 16, 0);
        }
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(PageManager::new(100, 4).is_err());
        assert!(PageManager::new(4096, 0).is_err());
    }
}
