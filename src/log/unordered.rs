//! # Unordered Log
//!
//! Log variant without a sealed prefix. Writers append to the write head;
//! bulk loaders build private page chains and splice them in with a single
//! CAS. Readers walk pages from the head and skip entries that are not yet
//! sealed.
//!
//! ## Head Layout
//!
//! The head is a pair `(write head, append head)` of arena page indices
//! packed into one atomic word. The append head anchors spliced chains
//! that are waiting to become the write chain; when the write head fills
//! up, the append chain is adopted wholesale before a fresh page is
//! allocated.

use super::{EntryRef, Log, LogEntry, LogPage, LogVariant, PagePtr, PageRef};

use crate::page::PageManager;
use crossbeam_utils::CachePadded;
use eyre::{eyre, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Arena index meaning "no page".
const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct LogHead {
    write: u32,
    append: u32,
}

impl LogHead {
    #[inline]
    fn pack(self) -> u64 {
        ((self.write as u64) << 32) | self.append as u64
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        Self {
            write: (word >> 32) as u32,
            append: word as u32,
        }
    }
}

/// Unordered log variant. Use through [`Log<Unordered>`](super::UnorderedLog).
pub struct Unordered {
    page_manager: Arc<PageManager>,
    head: CachePadded<AtomicU64>,
    tail: AtomicPtr<LogPage>,
    pages: AtomicUsize,
}

impl Unordered {
    fn page_size(&self) -> usize {
        self.page_manager.page_size()
    }

    fn page_of_index(&self, index: u32) -> PagePtr {
        PagePtr::from_raw(
            self.page_manager.page_at(index).as_ptr().cast(),
            self.page_size(),
        )
        .expect("arena pages are never null")
    }

    fn load_head(&self) -> LogHead {
        LogHead::unpack(self.head.load(Ordering::Acquire))
    }

    /// Splices the externally built chain `begin..=end` in front of the
    /// current append chain.
    pub(crate) fn append_page(&self, begin: PagePtr, end: PagePtr) {
        let mut chain_pages = 1;
        let mut page = begin;
        while page != end {
            chain_pages += 1;
            page = PagePtr::from_raw(page.header().next_page(), self.page_size())
                .expect("page chain broken before its end");
        }
        self.pages.fetch_add(chain_pages, Ordering::Relaxed);

        let mut old = self.load_head();
        loop {
            // The chain's last page links to whatever currently anchors
            // the append chain, or to the write chain if none is waiting.
            let anchor = if old.append != NIL {
                self.page_of_index(old.append)
            } else {
                self.page_of_index(old.write)
            };
            end.header().store_next(anchor.as_ptr());

            // Close the superseded append head against further writes.
            if old.append != NIL {
                self.page_of_index(old.append).header().seal();
            }

            let new_head = LogHead {
                write: old.write,
                append: self.page_manager.page_index(begin.as_raw_page()),
            };
            match self.head.compare_exchange(
                old.pack(),
                new_head.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => old = LogHead::unpack(current),
            }
        }
    }

    /// Unlinks the pages strictly between `begin` and `end`, returning
    /// them through SMR. `end == None` erases everything older than
    /// `begin` and makes `begin` the new tail.
    pub(crate) fn erase(&self, begin: PagePtr, end: Option<PagePtr>) {
        let end_ptr = end.map_or(std::ptr::null_mut(), |p| p.as_ptr());
        if begin.as_ptr() == end_ptr {
            return;
        }

        if end.is_none() {
            self.tail.store(begin.as_ptr(), Ordering::Release);
        }

        let unlinked = begin.header().next.swap(end_ptr, Ordering::AcqRel);
        if unlinked == end_ptr {
            return;
        }

        let mut erased = 0;
        let mut page = unlinked;
        while page != end_ptr {
            erased += 1;
            // SAFETY: the unlinked chain is still alive; frees below are
            // deferred through SMR.
            page = unsafe { (*page).next_page() };
        }
        self.pages.fetch_sub(erased, Ordering::Relaxed);

        super::free_page_range(&self.page_manager, unlinked, end_ptr);
    }

    /// Replaces a full write head: adopt the append chain if one is
    /// waiting, otherwise allocate. Returns the new head; a `NIL` write
    /// index means the pool is exhausted.
    fn create_page(&self, mut old: LogHead) -> LogHead {
        let original_write = old.write;

        // Seal the old write head so no one can append behind us.
        self.page_of_index(original_write).header().seal();

        loop {
            let mut allocated: Option<PagePtr> = None;
            let mut new_head = LogHead {
                write: old.append,
                append: NIL,
            };

            if old.append == NIL {
                let Some(raw) = self.page_manager.alloc() else {
                    tracing::error!("page pool exhausted while growing the unordered log");
                    return new_head;
                };
                let page = PagePtr::init(raw, self.page_size());
                self.pages.fetch_add(1, Ordering::Relaxed);
                page.header()
                    .store_next(self.page_of_index(original_write).as_ptr());
                new_head.write = self.page_manager.page_index(raw);
                allocated = Some(page);
            }

            match self.head.compare_exchange(
                old.pack(),
                new_head.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return new_head,
                Err(current) => {
                    let current = LogHead::unpack(current);
                    // Another thread already installed a head; the page we
                    // allocated was never published.
                    if let Some(page) = allocated {
                        self.pages.fetch_sub(1, Ordering::Relaxed);
                        unsafe { self.page_manager.free(page.as_raw_page()) };
                    }
                    if current.write == original_write {
                        // Only the append head changed; retry the swap.
                        old = current;
                        continue;
                    }
                    return current;
                }
            }
        }
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }
}

impl LogVariant for Unordered {
    fn with_page_manager(page_manager: Arc<PageManager>) -> Result<Self> {
        let raw = page_manager
            .alloc()
            .ok_or_else(|| eyre!("page pool exhausted while creating the log head"))?;
        let head = PagePtr::init(raw, page_manager.page_size());
        let packed = LogHead {
            write: page_manager.page_index(raw),
            append: NIL,
        }
        .pack();
        Ok(Self {
            head: CachePadded::new(AtomicU64::new(packed)),
            tail: AtomicPtr::new(head.as_ptr()),
            pages: AtomicUsize::new(1),
            page_manager,
        })
    }

    fn append_entry(
        &self,
        payload_size: u32,
        entry_size: u32,
        entry_type: u32,
    ) -> Option<NonNull<LogEntry>> {
        let mut head = self.load_head();
        while head.write != NIL {
            let page = self.page_of_index(head.write);
            if let Some(entry) = page.append_entry(payload_size, entry_size, entry_type) {
                return Some(entry.0);
            }
            head = self.create_page(head);
        }
        None
    }

    fn seal_entry(&self, entry: NonNull<LogEntry>) {
        // SAFETY: the caller got the entry from append on this log.
        unsafe { entry.as_ref() }.seal();
    }

    fn first_page(&self) -> *mut LogPage {
        let head = self.load_head();
        let index = if head.append != NIL {
            head.append
        } else {
            head.write
        };
        if index == NIL {
            return std::ptr::null_mut();
        }
        self.page_of_index(index).as_ptr()
    }

    fn page_manager(&self) -> &Arc<PageManager> {
        &self.page_manager
    }
}

impl Log<Unordered> {
    /// Builds a private, linked chain of `count` pages for bulk loading.
    /// Returns `None` when the pool cannot supply the pages.
    pub fn build_chain(&self, count: usize) -> Option<PageChain<'_>> {
        assert!(count > 0, "a page chain needs at least one page");
        let page_size = self.page_manager().page_size();

        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.page_manager().alloc() {
                Some(raw) => pages.push(PagePtr::init(raw, page_size)),
                None => {
                    for page in pages {
                        // Never published; return them directly.
                        unsafe { self.page_manager().free(page.as_raw_page()) };
                    }
                    return None;
                }
            }
        }
        for window in pages.windows(2) {
            window[0].header().store_next(window[1].as_ptr());
        }

        Some(PageChain {
            begin: pages[0],
            end: *pages.last().expect("chain is non-empty"),
            log: self,
        })
    }

    /// Splices a chain built with [`build_chain`](Self::build_chain) into
    /// the log. After the call the chain's pages are owned by the log.
    pub fn append_chain(&self, chain: PageChain<'_>) {
        assert!(
            std::ptr::eq(chain.log, self),
            "chain spliced into a foreign log"
        );
        self.variant().append_page(chain.begin, chain.end);
    }

    /// Unlinks all pages strictly between `begin` and `end` and retires
    /// them through SMR. With `end == None` everything older than `begin`
    /// is erased and `begin` becomes the tail.
    pub fn erase(&self, begin: &PageRef<'_>, end: Option<&PageRef<'_>>) {
        self.variant().erase(begin.raw(), end.map(|p| p.raw()));
    }

    /// Number of pages currently owned by the log.
    pub fn page_count(&self) -> usize {
        self.variant().page_count()
    }
}

/// Privately owned page chain that has not been spliced yet.
///
/// Entries appended here are invisible to log readers until
/// [`Log::append_chain`] publishes the chain.
pub struct PageChain<'a> {
    begin: PagePtr,
    end: PagePtr,
    log: &'a Log<Unordered>,
}

impl<'a> PageChain<'a> {
    /// Appends an entry into the chain, trying each page in order.
    pub fn append(&self, size: u32, entry_type: u32) -> Option<EntryRef<'a>> {
        assert!(size != 0, "entry payload must be greater than zero");
        let entry_size = LogEntry::entry_size_for(size);
        let page_size = self.log.page_manager().page_size();

        let mut page = self.begin;
        loop {
            if let Some(entry) = page.append_entry(size, entry_size, entry_type) {
                return Some(EntryRef::new(entry));
            }
            if page == self.end {
                return None;
            }
            page = PagePtr::from_raw(page.header().next_page(), page_size)
                .expect("page chain broken before its end");
        }
    }
}
