//! # Delta-Main Pages
//!
//! A main page holds a dense run of multi-version records. The GC
//! rewrites main pages record by record into *fill pages*: surviving
//! versions are copied over, buffered versions from the insert map are
//! absorbed, and the hash index is repointed as each record lands in its
//! new home.
//!
//! ## Page Layout
//!
//! ```text
//! 0..8    used byte count (including this header)
//! 8..12   start offset: first byte the GC has not relocated yet
//! 12..16  deletion marker
//! 16..    records, 8-byte aligned
//! ```
//!
//! The start offset makes the rewrite incremental: when a fill page runs
//! out mid-page, the completed fill page is published and the source page
//! keeps the cursor so the next pass resumes at the unfinished record.
//! Readers that race a rewrite keep working: the source page stays
//! readable (and marked for deletion) until SMR proves no guard can reach
//! it.

use super::insert_map::InsertMap;
use super::record::{self, RecordView};
use crate::config::MAIN_PAGE_HEADER_SIZE;
use crate::index::HashIndex;
use crate::page::PageManager;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Handle to one delta-main page inside the arena.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MainPage {
    ptr: NonNull<u8>,
    page_size: usize,
}

// SAFETY: the handle is an arena address; all mutation is done by the
// single GC thread of the owning table, reads are SMR-guarded.
unsafe impl Send for MainPage {}
unsafe impl Sync for MainPage {}

impl MainPage {
    /// Interprets a zeroed pool page as an empty main page.
    pub(crate) fn init(raw: NonNull<u8>, page_size: usize) -> Self {
        let page = Self {
            ptr: raw,
            page_size,
        };
        page.set_used(MAIN_PAGE_HEADER_SIZE as u64);
        page.set_start_offset(MAIN_PAGE_HEADER_SIZE as u32);
        page
    }

    pub(crate) fn as_raw_page(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    fn used_word(&self) -> &AtomicU64 {
        // SAFETY: pages are 16-byte aligned and live for the arena's
        // lifetime; the first word is only accessed atomically.
        unsafe { &*(self.ptr.as_ptr() as *const AtomicU64) }
    }

    #[inline]
    fn start_offset_word(&self) -> &AtomicU32 {
        // SAFETY: as above, offset 8 is 4-byte aligned.
        unsafe { &*(self.ptr.as_ptr().add(8) as *const AtomicU32) }
    }

    #[inline]
    fn deleted_word(&self) -> &AtomicU32 {
        // SAFETY: as above, offset 12 is 4-byte aligned.
        unsafe { &*(self.ptr.as_ptr().add(12) as *const AtomicU32) }
    }

    /// Bytes used on this page, header included.
    pub fn used(&self) -> usize {
        self.used_word().load(Ordering::Acquire) as usize
    }

    fn set_used(&self, used: u64) {
        self.used_word().store(used, Ordering::Release);
    }

    /// First byte the incremental GC has not relocated yet.
    pub fn start_offset(&self) -> usize {
        self.start_offset_word().load(Ordering::Acquire) as usize
    }

    fn set_start_offset(&self, offset: u32) {
        self.start_offset_word().store(offset, Ordering::Release);
    }

    /// Marks the page as doomed: a rewrite has begun and readers should
    /// expect the index to point elsewhere shortly.
    pub fn is_marked_deleted(&self) -> bool {
        self.deleted_word().load(Ordering::Acquire) != 0
    }

    fn mark_deleted(&self) {
        self.deleted_word().store(1, Ordering::Release);
    }

    /// Record region of the page (everything behind the header).
    fn record_bytes(&self) -> &[u8] {
        // SAFETY: the region excludes the atomically updated header words
        // and is only written by the owning GC before publication.
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(MAIN_PAGE_HEADER_SIZE),
                self.page_size - MAIN_PAGE_HEADER_SIZE,
            )
        }
    }

    /// Record starting at the page-absolute `offset`.
    pub fn record_at(&self, offset: usize) -> RecordView<'_> {
        debug_assert!(offset >= MAIN_PAGE_HEADER_SIZE && offset < self.used());
        RecordView::parse(&self.record_bytes()[offset - MAIN_PAGE_HEADER_SIZE..])
    }

    /// Walks `(offset, record)` pairs up to the used boundary.
    pub fn records(&self) -> impl Iterator<Item = (usize, RecordView<'_>)> + '_ {
        let mut offset = MAIN_PAGE_HEADER_SIZE;
        let used = self.used();
        std::iter::from_fn(move || {
            if offset >= used {
                return None;
            }
            let record = self.record_at(offset);
            let current = offset;
            offset += record.size();
            Some((current, record))
        })
    }

    /// One GC step over this page. Resumes at the stored start offset and
    /// stops early when the fill page runs out.
    pub(crate) fn gc(
        &self,
        lowest_active_version: u64,
        insert_map: &mut InsertMap,
        index: &HashIndex,
        fill: &mut Option<FillState>,
        page_manager: &PageManager,
    ) -> PageGcOutcome {
        let used = self.used();
        let start = self.start_offset();

        // Phase A: decide whether anything on this page needs work. A
        // non-initial start offset means an earlier step already decided.
        let mut has_to_clean = start != MAIN_PAGE_HEADER_SIZE;
        let mut probe = start;
        while probe < used && !has_to_clean {
            let record = self.record_at(probe);
            if record.needs_cleaning(lowest_active_version, insert_map) {
                has_to_clean = true;
                break;
            }
            probe += record.size();
        }
        if !has_to_clean {
            return PageGcOutcome::Clean;
        }

        // Phase B: rewrite. Readers finishing a lookup now learn that the
        // page is doomed.
        if start == MAIN_PAGE_HEADER_SIZE {
            self.mark_deleted();
        }
        let Some(fill_state) = FillState::ensure(fill, page_manager) else {
            return PageGcOutcome::OutOfPages;
        };

        let mut offset = start;
        while offset < used {
            let record = self.record_at(offset);
            let key = record.key();
            let pending = insert_map.get(key);
            match record.copy_and_compact(lowest_active_version, pending, fill_state.remaining()) {
                None => {
                    assert!(
                        !fill_state.is_empty(),
                        "record for key {key} exceeds an empty fill page"
                    );
                    // Resume here once the caller swapped in a new fill
                    // page.
                    self.set_start_offset(offset as u32);
                    return PageGcOutcome::FillExhausted;
                }
                Some(0) => {
                    // Nothing visible survived; the key disappears.
                    index.remove(key);
                    insert_map.remove(key);
                }
                Some(written) => {
                    index.insert(key, fill_state.cursor(), true);
                    insert_map.remove(key);
                    fill_state.advance(written);
                }
            }
            offset += record.size();
        }

        self.set_start_offset(used as u32);
        PageGcOutcome::Done
    }
}

impl std::fmt::Debug for MainPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainPage")
            .field("used", &self.used())
            .field("start_offset", &self.start_offset())
            .field("deleted", &self.is_marked_deleted())
            .finish()
    }
}

/// Result of one GC step over a main page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageGcOutcome {
    /// Nothing to do; the page stays as is.
    Clean,
    /// Every record was relocated (or dropped); the page is doomed.
    Done,
    /// The fill page ran out of space; finalize it and call again.
    FillExhausted,
    /// No fill page could be allocated; the pass must stop.
    OutOfPages,
}

/// Fill page under construction plus its write cursor.
pub(crate) struct FillState {
    page: MainPage,
    offset: usize,
}

impl FillState {
    /// Makes sure `slot` holds a fill page, allocating one if needed.
    pub(crate) fn ensure<'a>(
        slot: &'a mut Option<FillState>,
        page_manager: &PageManager,
    ) -> Option<&'a mut FillState> {
        if slot.is_none() {
            let raw = page_manager.alloc()?;
            *slot = Some(FillState {
                page: MainPage::init(raw, page_manager.page_size()),
                offset: MAIN_PAGE_HEADER_SIZE,
            });
        }
        slot.as_mut()
    }

    /// The unwritten remainder of the fill page.
    fn remaining(&mut self) -> &mut [u8] {
        // SAFETY: everything before `offset` is published through the
        // index; the remainder is exclusively owned by the GC.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.page.ptr.as_ptr().add(self.offset),
                self.page.page_size - self.offset,
            )
        }
    }

    fn cursor(&self) -> NonNull<u8> {
        // SAFETY: offset stays within the page.
        unsafe { NonNull::new_unchecked(self.page.ptr.as_ptr().add(self.offset)) }
    }

    fn advance(&mut self, written: usize) {
        self.offset += written;
        debug_assert!(self.offset <= self.page.page_size);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset == MAIN_PAGE_HEADER_SIZE
    }

    /// Writes the used byte count and returns the finished page.
    pub(crate) fn finalize(self) -> MainPage {
        self.page.set_used(self.offset as u64);
        self.page.set_start_offset(MAIN_PAGE_HEADER_SIZE as u32);
        self.page
    }

    /// Returns the untouched page straight to the pool.
    pub(crate) fn discard(self, page_manager: &PageManager) {
        debug_assert!(self.is_empty(), "discarding a fill page with records");
        // SAFETY: an empty fill page was never published anywhere.
        unsafe { page_manager.free(self.page.ptr) };
    }
}

/// Phase C: folds buffered inserts for keys that have no record yet into
/// the fill page. Keys that are already indexed were placed by an earlier
/// step (the insert log is truncated per page, so re-scans happen) and
/// are simply dropped from the map.
pub(crate) fn fill_with_inserts(
    lowest_active_version: u64,
    insert_map: &mut InsertMap,
    index: &HashIndex,
    fill: &mut Option<FillState>,
    page_manager: &PageManager,
) -> PageGcOutcome {
    loop {
        let Some(key) = insert_map.any_key() else {
            return PageGcOutcome::Done;
        };
        if index.get(key).is_some() {
            insert_map.remove(key);
            continue;
        }

        let Some(fill_state) = FillState::ensure(fill, page_manager) else {
            return PageGcOutcome::OutOfPages;
        };
        let pending = insert_map.get(key).expect("key was just observed");
        match record::build_from_pending(
            key,
            pending,
            lowest_active_version,
            fill_state.remaining(),
        ) {
            None => return PageGcOutcome::FillExhausted,
            Some(0) => {
                insert_map.remove(key);
            }
            Some(written) => {
                let placed = index.insert(key, fill_state.cursor(), false);
                debug_assert!(placed, "key folded twice within one pass");
                fill_state.advance(written);
                insert_map.remove(key);
            }
        }
    }
}
