//! # Ordered Log
//!
//! Log variant that maintains a *sealed head*: the position up to which
//! every preceding entry is sealed. Iterating from the tail to the sealed
//! head yields a dense, in-order, finalized prefix, which makes the
//! ordered log suitable for anything that needs replay in commit order.
//!
//! ## State
//!
//! ```text
//!  tail ────────────► sealed head ───────► head page offset
//!  │   immutable,          │   acquired but possibly   │
//!  │   fully sealed        │   unsealed entries        │
//! ```
//!
//! The sealed head and the tail are `(page index, byte offset)` pairs
//! packed into one atomic word each, so both advance with plain 64-bit
//! CAS. Advancing the sealed head is cooperative: whichever sealer finds
//! the head pointing at its own entry walks it forward over every sealed
//! entry, and a failed CAS means another thread took over the walk.

use super::{
    free_page_range, EntryRef, Log, LogEntry, LogPage, LogPosition, LogVariant, PagePtr,
};
use crate::config::{FIRST_ENTRY_OFFSET, LOG_ENTRY_HEADER_SIZE};
use crate::page::PageManager;
use crate::smr::{self, Guard};
use crossbeam_utils::CachePadded;
use eyre::{eyre, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Ordered log variant. Use through [`Log<Ordered>`](super::OrderedLog).
pub struct Ordered {
    page_manager: Arc<PageManager>,
    head: CachePadded<AtomicPtr<LogPage>>,
    sealed_head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

impl Ordered {
    fn page_size(&self) -> usize {
        self.page_manager.page_size()
    }

    fn position_of(&self, page: PagePtr, offset: u32) -> LogPosition {
        LogPosition::new(self.page_manager.page_index(page.as_raw_page()), offset)
    }

    fn page_of(&self, position: LogPosition) -> PagePtr {
        PagePtr::from_raw(
            self.page_manager.page_at(position.page).as_ptr().cast(),
            self.page_size(),
        )
        .expect("arena pages are never null")
    }

    /// State of the slot at `offset` as the sealed-head walk sees it:
    /// `(payload size, sealed)`. Unclaimed slots and slots that cannot
    /// exist (no room for another header) read as empty *sealed* slots:
    /// the walk then consults the page state to decide between stopping
    /// at the live offset and crossing to the next page.
    fn slot_state(&self, page: PagePtr, offset: u32) -> (u32, bool) {
        if offset as usize + LOG_ENTRY_HEADER_SIZE <= self.page_size() {
            let (size, sealed) = page.entry_at(offset).header().size_and_sealed();
            if size == 0 {
                (0, true)
            } else {
                (size, sealed)
            }
        } else {
            (0, true)
        }
    }

    /// Walks the sealed head forward over sealed entries, crossing page
    /// boundaries where the page is sealed and fully consumed. Returns
    /// without retrying when another thread moved the head first; that
    /// thread owns the rest of the walk.
    fn advance_sealed_head(&self, mut published: LogPosition) {
        // Pin the epoch: a concurrent truncate may retire pages while we
        // walk.
        let _guard = smr::enter();

        let mut cursor = published;
        let mut page = self.page_of(cursor);
        let (mut size, mut sealed) = self.slot_state(page, cursor.offset);

        loop {
            while sealed {
                if size == 0 {
                    // No entry here: either trailing space too small for a
                    // header or the slot is unclaimed. Cross to the next
                    // page only once this one is sealed and fully
                    // consumed.
                    let (page_offset, page_sealed) = page.header().offset_and_sealed();
                    if !page_sealed {
                        break;
                    }
                    if page_offset > cursor.offset {
                        // An append landed here in the meantime.
                        let state = self.slot_state(page, cursor.offset);
                        size = state.0;
                        sealed = state.1;
                        debug_assert!(size != 0, "unclaimed slot below the page offset");
                    } else {
                        let Some(next) =
                            PagePtr::from_raw(page.header().next_page(), self.page_size())
                        else {
                            break;
                        };
                        page = next;
                        cursor = self.position_of(page, FIRST_ENTRY_OFFSET as u32);
                        let state = self.slot_state(page, cursor.offset);
                        size = state.0;
                        sealed = state.1;
                    }
                } else {
                    cursor.offset += LogEntry::entry_size_for(size);
                    let state = self.slot_state(page, cursor.offset);
                    size = state.0;
                    sealed = state.1;
                }
            }

            // Publish the new head. A failed CAS means another sealer
            // advanced it and owns the remaining work.
            if self
                .sealed_head
                .compare_exchange(
                    published.pack(),
                    cursor.pack(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return;
            }
            published = cursor;

            // The entry we stopped at may have been sealed while we were
            // publishing; if so, keep walking.
            let state = self.slot_state(page, cursor.offset);
            size = state.0;
            sealed = state.1;

            if size == 0 {
                let (page_offset, page_sealed) = page.header().offset_and_sealed();
                if !page_sealed {
                    return;
                }
                if page_offset > cursor.offset {
                    let state = self.slot_state(page, cursor.offset);
                    size = state.0;
                    sealed = state.1;
                    debug_assert!(size != 0, "unclaimed slot below the page offset");
                } else {
                    let Some(next) = PagePtr::from_raw(page.header().next_page(), self.page_size())
                    else {
                        return;
                    };
                    page = next;
                    cursor = self.position_of(page, FIRST_ENTRY_OFFSET as u32);
                    let state = self.slot_state(page, cursor.offset);
                    size = state.0;
                    sealed = state.1;
                }
            }

            if !sealed {
                return;
            }
        }
    }

    /// Moves the write head past a full page. Cooperates with concurrent
    /// allocators: whoever CASes `next` first wins, everyone else adopts
    /// the winner's page. Returns `None` only when the pool is exhausted.
    fn create_page(&self, old_head: PagePtr) -> Option<*mut LogPage> {
        // Another thread may already have linked a successor.
        let next = old_head.header().next_page();
        if !next.is_null() {
            return Some(
                match self.head.compare_exchange(
                    old_head.as_ptr(),
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => next,
                    Err(current) => current,
                },
            );
        }

        // Seal the old head so no append can land behind the boundary.
        old_head.header().seal();

        let raw = self.page_manager.alloc()?;
        let new_page = PagePtr::init(raw, self.page_size());

        if let Err(actual) = old_head
            .header()
            .cas_next(std::ptr::null_mut(), new_page.as_ptr())
        {
            // Lost the race; the page was never published.
            unsafe { self.page_manager.free(new_page.as_raw_page()) };
            return Some(actual);
        }

        // Best effort: if this fails another thread already moved the head
        // for us.
        let _ = self.head.compare_exchange(
            old_head.as_ptr(),
            new_page.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        // If the sealed head sits at the end of the old page it must cross
        // over, otherwise sealing on the new page would never trigger the
        // advance.
        let sealed = LogPosition::unpack(self.sealed_head.load(Ordering::Acquire));
        let (old_offset, _) = old_head.header().offset_and_sealed();
        if sealed.page == self.page_manager.page_index(old_head.as_raw_page())
            && sealed.offset == old_offset
        {
            self.advance_sealed_head(sealed);
        }

        Some(new_page.as_ptr())
    }

    pub(crate) fn sealed_head_position(&self) -> LogPosition {
        LogPosition::unpack(self.sealed_head.load(Ordering::Acquire))
    }

    pub(crate) fn tail_position(&self) -> LogPosition {
        LogPosition::unpack(self.tail.load(Ordering::Acquire))
    }

    pub(crate) fn truncate(&self, old_tail: LogPosition, new_tail: LogPosition) -> bool {
        if self
            .tail
            .compare_exchange(
                old_tail.pack(),
                new_tail.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        if old_tail.page != new_tail.page {
            free_page_range(
                &self.page_manager,
                self.page_of(old_tail).as_ptr(),
                self.page_of(new_tail).as_ptr(),
            );
        }
        true
    }
}

impl LogVariant for Ordered {
    fn with_page_manager(page_manager: Arc<PageManager>) -> Result<Self> {
        let raw = page_manager
            .alloc()
            .ok_or_else(|| eyre!("page pool exhausted while creating the log head"))?;
        let head = PagePtr::init(raw, page_manager.page_size());
        let start = LogPosition::new(
            page_manager.page_index(head.as_raw_page()),
            FIRST_ENTRY_OFFSET as u32,
        );
        Ok(Self {
            head: CachePadded::new(AtomicPtr::new(head.as_ptr())),
            sealed_head: CachePadded::new(AtomicU64::new(start.pack())),
            tail: CachePadded::new(AtomicU64::new(start.pack())),
            page_manager,
        })
    }

    fn append_entry(
        &self,
        payload_size: u32,
        entry_size: u32,
        entry_type: u32,
    ) -> Option<NonNull<LogEntry>> {
        let mut head = self.head.load(Ordering::Acquire);
        while let Some(page) = PagePtr::from_raw(head, self.page_size()) {
            if let Some(entry) = page.append_entry(payload_size, entry_size, entry_type) {
                return Some(entry.0);
            }
            // The page is full or sealed; move to (or help install) the
            // next one.
            head = self.create_page(page)?;
        }
        None
    }

    fn seal_entry(&self, entry: NonNull<LogEntry>) {
        // SAFETY: the caller got the entry from append on this log.
        unsafe { entry.as_ref() }.seal();

        let sealed = self.sealed_head_position();
        let head_entry_addr =
            self.page_manager.page_at(sealed.page).as_ptr() as usize + sealed.offset as usize;
        if head_entry_addr != entry.as_ptr() as usize {
            // Another unsealed entry is still ahead; its sealer will
            // trigger the advance.
            return;
        }
        self.advance_sealed_head(sealed);
    }

    fn first_page(&self) -> *mut LogPage {
        self.page_of(self.tail_position()).as_ptr()
    }

    fn page_manager(&self) -> &Arc<PageManager> {
        &self.page_manager
    }
}

impl Log<Ordered> {
    /// Position of the sealed head: everything strictly before it is
    /// sealed and safe to read.
    pub fn sealed_head(&self) -> LogPosition {
        self.variant().sealed_head_position()
    }

    /// Position of the oldest entry still referenced by the log.
    pub fn tail(&self) -> LogPosition {
        self.variant().tail_position()
    }

    /// Moves the tail from `old_tail` to `new_tail`, retiring the pages in
    /// between through SMR. Returns `false` when a concurrent truncate
    /// already advanced the tail; the caller must re-read and decide
    /// whether to retry.
    pub fn truncate(&self, old_tail: LogPosition, new_tail: LogPosition) -> bool {
        self.variant().truncate(old_tail, new_tail)
    }

    /// Iterates the dense sealed prefix from the tail to the sealed head.
    pub fn iter<'g>(&'g self, _guard: &'g Guard) -> OrderedLogIter<'g> {
        let variant = self.variant();
        let tail = variant.tail_position();
        OrderedLogIter {
            log: variant,
            page: variant.page_of(tail),
            offset: tail.offset,
            end: variant.sealed_head_position(),
        }
    }
}

/// Iterator over the sealed prefix of an ordered log.
pub struct OrderedLogIter<'g> {
    log: &'g Ordered,
    page: PagePtr,
    offset: u32,
    end: LogPosition,
}

impl<'g> OrderedLogIter<'g> {
    /// Position of the entry the iterator would yield next.
    pub fn position(&self) -> LogPosition {
        self.log.position_of(self.page, self.offset)
    }
}

impl<'g> Iterator for OrderedLogIter<'g> {
    type Item = EntryRef<'g>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if OrderedLogIter::position(self) == self.end {
                return None;
            }

            let page_size = self.log.page_size();
            let (live_offset, _) = self.page.header().offset_and_sealed();
            if self.offset as usize + LOG_ENTRY_HEADER_SIZE > page_size
                || self.offset >= live_offset
            {
                let next = PagePtr::from_raw(self.page.header().next_page(), page_size)?;
                self.page = next;
                self.offset = FIRST_ENTRY_OFFSET as u32;
                continue;
            }

            let entry = self.page.entry_at(self.offset);
            let (size, sealed) = entry.header().size_and_sealed();
            debug_assert!(size != 0 && sealed, "unsealed entry inside the sealed prefix");
            self.offset += LogEntry::entry_size_for(size);
            return Some(EntryRef::new(entry));
        }
    }
}
