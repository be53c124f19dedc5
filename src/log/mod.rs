//! # Append-Only Paged Log
//!
//! The log is a singly linked list of pool pages appended to by many
//! writers without locks. Two variants share the same page and entry
//! layout and the same slot acquisition algorithm:
//!
//! - [`Ordered`](ordered::Ordered): a single write head plus a sealed-head
//!   pointer tracking the dense prefix of finalized entries. Iteration
//!   yields exactly the sealed prefix in acquisition order.
//! - [`Unordered`](unordered::Unordered): a write head plus an append head
//!   for splicing externally built page chains. Readers skip unsealed
//!   entries by the per-entry sealed bit.
//!
//! ## Page Layout
//!
//! ```text
//! 0..4    offset word: (next free byte << 1) | open bit     (atomic)
//! 4..8    reserved
//! 8..16   next page pointer                                 (atomic)
//! 16..24  grid phase (unused)
//! 24..    entry slots, each a multiple of 16 bytes
//! ```
//!
//! Pages are 16-byte aligned, so the 8-byte phase puts every entry header
//! at an address with `addr % 16 == 8`.
//!
//! ## Entry Layout
//!
//! ```text
//! 0..4    size word: (payload size << 2) | sealed | acquired  (atomic)
//! 4..8    entry type                                          (atomic)
//! 8..16   reserved
//! 16..    payload
//! ```
//!
//! A zero size word means the slot is unclaimed. A writer claims a slot by
//! CASing the full size word in one shot, so any scanner that observes a
//! non-zero word knows both that the slot is taken and how far to skip.
//! The sealed bit is a monotone latch announcing that the payload is
//! consistent.
//!
//! ## Slot Acquisition
//!
//! `append` races writers within the head page: each contender CASes the
//! size word at the current offset; losers learn the winner's entry size
//! from the observed word and retry one slot further. The page offset is
//! then CAS-advanced monotonically. Sealing a page commutes with in-flight
//! acquisitions: an acquisition that was fully covered by the final offset
//! wins, one that was not returns null and moves to a fresh page.

pub mod ordered;
pub mod unordered;

use crate::config::{ENTRY_ALIGNMENT, FIRST_ENTRY_OFFSET, LOG_ENTRY_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::page::PageManager;
use crate::smr::{self, Guard};
use eyre::Result;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

pub use ordered::{Ordered, OrderedLogIter};
pub use unordered::{PageChain, Unordered};

/// Ordered log over pool pages.
pub type OrderedLog = Log<Ordered>;
/// Unordered log over pool pages.
pub type UnorderedLog = Log<Unordered>;

const PAGE_OPEN_BIT: u32 = 0x1;
const ENTRY_ACQUIRED_BIT: u32 = 0b01;
const ENTRY_SEALED_BIT: u32 = 0b10;

/// Log page header. Lives at the start of a pool page; the entry region
/// follows behind it.
#[repr(C)]
pub struct LogPage {
    /// `(next free byte << 1) | open bit`. Clearing the open bit seals the
    /// page; the offset itself never moves backwards.
    offset: AtomicU32,
    _reserved: u32,
    next: AtomicPtr<LogPage>,
}

const _: () = assert!(std::mem::size_of::<LogPage>() == PAGE_HEADER_SIZE);

impl LogPage {
    /// Reads `(live offset, sealed)` from the offset word.
    #[inline]
    pub(crate) fn offset_and_sealed(&self) -> (u32, bool) {
        let word = self.offset.load(Ordering::Acquire);
        (word >> 1, word & PAGE_OPEN_BIT == 0)
    }

    /// Seals the page. Monotone; concurrent acquisitions that were already
    /// covered by the final offset stay valid.
    pub(crate) fn seal(&self) {
        self.offset.fetch_and(!PAGE_OPEN_BIT, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn next_page(&self) -> *mut LogPage {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn store_next(&self, next: *mut LogPage) {
        self.next.store(next, Ordering::Release);
    }

    pub(crate) fn cas_next(
        &self,
        current: *mut LogPage,
        new: *mut LogPage,
    ) -> std::result::Result<(), *mut LogPage> {
        self.next
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }
}

/// Log entry header. Slots are claimed by CASing the size word from zero.
#[repr(C)]
pub struct LogEntry {
    size: AtomicU32,
    entry_type: AtomicU32,
    _reserved: u64,
}

const _: () = assert!(std::mem::size_of::<LogEntry>() == LOG_ENTRY_HEADER_SIZE);

impl LogEntry {
    /// Total slot bytes consumed by an entry with the given payload size.
    #[inline]
    pub fn entry_size_for(payload_size: u32) -> u32 {
        let align = ENTRY_ALIGNMENT as u32;
        LOG_ENTRY_HEADER_SIZE as u32 + (payload_size + align - 1) / align * align
    }

    /// Tries to claim this slot. On failure returns the slot size of the
    /// entry another writer acquired here, so the caller can skip past it.
    fn try_acquire(&self, payload_size: u32, entry_type: u32) -> std::result::Result<(), u32> {
        debug_assert!(payload_size != 0, "payload size must be greater than zero");
        debug_assert!(payload_size >> 30 == 0, "payload size exceeds the size word");

        let claimed = (payload_size << 2) | ENTRY_ACQUIRED_BIT;
        match self
            .size
            .compare_exchange(0, claimed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.entry_type.store(entry_type, Ordering::Release);
                Ok(())
            }
            Err(occupied) => Err(Self::entry_size_for(occupied >> 2)),
        }
    }

    /// Reads `(payload size, sealed)`. A zero payload size means the slot
    /// is unclaimed.
    #[inline]
    pub(crate) fn size_and_sealed(&self) -> (u32, bool) {
        let word = self.size.load(Ordering::Acquire);
        (word >> 2, word & ENTRY_SEALED_BIT != 0)
    }

    pub(crate) fn seal(&self) {
        let previous = self.size.fetch_or(ENTRY_SEALED_BIT, Ordering::AcqRel);
        debug_assert!(
            previous & ENTRY_ACQUIRED_BIT != 0,
            "sealed an unclaimed entry"
        );
    }

    #[inline]
    pub fn payload_size(&self) -> u32 {
        self.size.load(Ordering::Acquire) >> 2
    }

    #[inline]
    pub fn entry_type(&self) -> u32 {
        self.entry_type.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.size.load(Ordering::Acquire) & ENTRY_SEALED_BIT != 0
    }
}

/// Raw pointer to a log page, carrying full-page provenance.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct PagePtr {
    ptr: NonNull<LogPage>,
    page_size: usize,
}

impl PagePtr {
    /// Interprets a zeroed pool page as a log page and opens it.
    pub(crate) fn init(raw: NonNull<u8>, page_size: usize) -> Self {
        let page = Self {
            ptr: raw.cast(),
            page_size,
        };
        // The pool hands out zeroed pages; only the offset word needs a
        // real value.
        page.header().offset.store(
            ((FIRST_ENTRY_OFFSET as u32) << 1) | PAGE_OPEN_BIT,
            Ordering::Release,
        );
        page
    }

    pub(crate) fn from_raw(ptr: *mut LogPage, page_size: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, page_size })
    }

    #[inline]
    pub(crate) fn header(&self) -> &LogPage {
        // SAFETY: the pointer addresses a live pool page that starts with
        // a LogPage header.
        unsafe { self.ptr.as_ref() }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut LogPage {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_raw_page(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Entry header at the given byte offset within the page.
    pub(crate) fn entry_at(&self, offset: u32) -> EntryPtr {
        debug_assert!(offset as usize % ENTRY_ALIGNMENT == ENTRY_ALIGNMENT / 2);
        debug_assert!(offset as usize + LOG_ENTRY_HEADER_SIZE <= self.page_size);
        // SAFETY: offset is within the page, which is mapped and non-null.
        let entry = unsafe { self.ptr.as_ptr().cast::<u8>().add(offset as usize) };
        EntryPtr(unsafe { NonNull::new_unchecked(entry.cast()) })
    }

    /// Claims a slot for an entry of `entry_size` bytes, racing other
    /// writers on this page. Returns `None` when the page is sealed or has
    /// no room.
    pub(crate) fn append_entry(
        &self,
        payload_size: u32,
        entry_size: u32,
        entry_type: u32,
    ) -> Option<EntryPtr> {
        let offset_word = self.header().offset.load(Ordering::Acquire);
        if offset_word & PAGE_OPEN_BIT == 0 {
            return None;
        }
        let mut position = offset_word >> 1;

        loop {
            let end_position = position + entry_size;
            if end_position as usize > self.page_size {
                return None;
            }

            let entry = self.entry_at(position);
            if let Err(occupied_size) = entry.header().try_acquire(payload_size, entry_type) {
                // Another writer owns this slot; its size word tells us
                // where the next slot starts.
                position += occupied_size;
                continue;
            }

            // Advance the page offset over our slot until we or a later
            // writer published an offset at least as high.
            let new_word = (end_position << 1) | PAGE_OPEN_BIT;
            let mut offset_word = offset_word;
            while offset_word < new_word {
                match self.header().offset.compare_exchange(
                    offset_word,
                    new_word,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(current) => {
                        offset_word = current;
                        if offset_word & PAGE_OPEN_BIT == 0 {
                            if (offset_word >> 1) >= end_position {
                                // Sealed after our slot was fully covered.
                                break;
                            }
                            // Sealed before our slot was covered: the slot
                            // lies beyond the sealed offset and is never
                            // observed.
                            return None;
                        }
                    }
                }
            }

            return Some(entry);
        }
    }

    /// Walks the acquired entries of this page, stopping at the first
    /// unclaimed slot. Yields both sealed and unsealed entries.
    pub(crate) fn entries(&self) -> PageEntryIter {
        PageEntryIter {
            page: *self,
            offset: FIRST_ENTRY_OFFSET as u32,
        }
    }
}

/// Raw pointer to a log entry header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryPtr(NonNull<LogEntry>);

impl EntryPtr {
    #[inline]
    pub(crate) fn header(&self) -> &LogEntry {
        // SAFETY: the pointer addresses a claimed entry slot within a live
        // page.
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: the payload directly follows the entry header within the
        // same page.
        unsafe { self.0.as_ptr().cast::<u8>().add(LOG_ENTRY_HEADER_SIZE) }
    }
}

/// Handle to a log entry, valid while the log (or an SMR guard covering
/// the iteration) is alive.
#[derive(Clone, Copy)]
pub struct EntryRef<'a> {
    entry: EntryPtr,
    _marker: PhantomData<&'a LogEntry>,
}

impl<'a> EntryRef<'a> {
    pub(crate) fn new(entry: EntryPtr) -> Self {
        Self {
            entry,
            _marker: PhantomData,
        }
    }

    pub fn payload_size(&self) -> u32 {
        self.entry.header().payload_size()
    }

    pub fn entry_type(&self) -> u32 {
        self.entry.header().entry_type()
    }

    pub fn is_sealed(&self) -> bool {
        self.entry.header().is_sealed()
    }

    /// Payload bytes of the entry. Readers must only call this after
    /// observing [`is_sealed`](Self::is_sealed).
    pub fn payload(&self) -> &'a [u8] {
        let size = self.payload_size() as usize;
        // SAFETY: the slot was claimed with this payload size, so the
        // bytes lie within the page.
        unsafe { std::slice::from_raw_parts(self.entry.payload_ptr(), size) }
    }

    /// Copies `data` into the entry payload. Only the writer that appended
    /// the entry may call this, and only before sealing it.
    pub fn write_payload(&self, data: &[u8]) {
        self.write_payload_at(0, data);
    }

    /// Copies `data` into the entry payload starting at `offset`.
    pub fn write_payload_at(&self, offset: usize, data: &[u8]) {
        debug_assert!(!self.is_sealed(), "writing into a sealed entry");
        assert!(
            offset + data.len() <= self.payload_size() as usize,
            "payload write out of bounds"
        );
        // SAFETY: bounds checked above; the writer owns the slot until it
        // seals the entry.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.entry.payload_ptr().add(offset),
                data.len(),
            );
        }
    }

    pub(crate) fn raw(&self) -> EntryPtr {
        self.entry
    }
}

/// Position of an entry within a log: arena page index plus byte offset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LogPosition {
    pub(crate) page: u32,
    pub(crate) offset: u32,
}

impl LogPosition {
    pub(crate) fn new(page: u32, offset: u32) -> Self {
        Self { page, offset }
    }

    #[inline]
    pub(crate) fn pack(self) -> u64 {
        ((self.page as u64) << 32) | self.offset as u64
    }

    #[inline]
    pub(crate) fn unpack(word: u64) -> Self {
        Self {
            page: (word >> 32) as u32,
            offset: word as u32,
        }
    }

    /// Arena index of the page this position refers to.
    pub fn page_index(&self) -> u32 {
        self.page
    }

    /// Byte offset within the page.
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Behavior that distinguishes the ordered and unordered logs. The outer
/// [`Log`] is generic over this, so the variant dispatch is static.
pub trait LogVariant: Sized {
    fn with_page_manager(page_manager: Arc<PageManager>) -> Result<Self>;

    /// Appends an entry of `entry_size` slot bytes, allocating pages as
    /// needed. `None` means the pool is exhausted.
    fn append_entry(
        &self,
        payload_size: u32,
        entry_size: u32,
        entry_type: u32,
    ) -> Option<NonNull<LogEntry>>;

    /// Finalizes an entry.
    fn seal_entry(&self, entry: NonNull<LogEntry>);

    /// First page of the variant's page chain (for iteration and drop).
    fn first_page(&self) -> *mut LogPage;

    fn page_manager(&self) -> &Arc<PageManager>;
}

/// Append-only log, generic over the ordered/unordered variant.
pub struct Log<V: LogVariant> {
    variant: V,
}

impl<V: LogVariant> Log<V> {
    /// Creates a log with one page pre-allocated as the write head.
    pub fn new(page_manager: Arc<PageManager>) -> Result<Self> {
        Ok(Self {
            variant: V::with_page_manager(page_manager)?,
        })
    }

    /// Appends an entry with a payload of `size` bytes. Returns `None`
    /// when the page pool is exhausted.
    pub fn append(&self, size: u32, entry_type: u32) -> Option<EntryRef<'_>> {
        assert!(size != 0, "entry payload must be greater than zero");
        if size as usize > self.max_entry_size() {
            debug_assert!(
                false,
                "tried to append {} payload bytes but {} is the maximum",
                size,
                self.max_entry_size()
            );
            return None;
        }
        let entry_size = LogEntry::entry_size_for(size);
        self.variant
            .append_entry(size, entry_size, entry_type)
            .map(|entry| EntryRef::new(EntryPtr(entry)))
    }

    /// Marks the entry as finalized and safe to read.
    pub fn seal(&self, entry: &EntryRef<'_>) {
        self.variant.seal_entry(entry.raw().0);
    }

    /// Largest payload size a single entry can carry.
    pub fn max_entry_size(&self) -> usize {
        max_entry_size(self.variant.page_manager().page_size())
    }

    /// Walks the log's pages. The guard keeps concurrently retired pages
    /// alive for the duration of the traversal.
    pub fn pages<'g>(&self, _guard: &'g Guard) -> PageIter<'g> {
        PageIter {
            current: self.variant.first_page(),
            page_size: self.variant.page_manager().page_size(),
            _guard: PhantomData,
        }
    }

    pub fn page_manager(&self) -> &Arc<PageManager> {
        self.variant.page_manager()
    }

    pub(crate) fn variant(&self) -> &V {
        &self.variant
    }
}

impl<V: LogVariant> Drop for Log<V> {
    fn drop(&mut self) {
        // SMR guarantees no one references the log once it is dropped, so
        // the remaining pages can go back to the pool directly.
        let page_manager = Arc::clone(self.variant.page_manager());
        let mut page = self.variant.first_page();
        while let Some(current) = PagePtr::from_raw(page, page_manager.page_size()) {
            let next = current.header().next_page();
            unsafe { page_manager.free(current.as_raw_page()) };
            page = next;
        }
    }
}

/// Largest payload that fits an empty page of the given size.
pub fn max_entry_size(page_size: usize) -> usize {
    page_size - FIRST_ENTRY_OFFSET - LOG_ENTRY_HEADER_SIZE - ENTRY_PHASE_REMAINDER
}

// Entry slots are multiples of 16 while the usable region after the phase
// ends 8 bytes short of a multiple, so the last 8 bytes of a page can
// never be covered by a slot.
const ENTRY_PHASE_REMAINDER: usize = crate::config::ENTRY_PHASE;

/// Frees the page range `[begin, end)` once all epoch guards that could
/// have observed the pages are gone.
pub(crate) fn free_page_range(
    page_manager: &Arc<PageManager>,
    begin: *mut LogPage,
    end: *mut LogPage,
) {
    struct Range(*mut LogPage, *mut LogPage);
    // SAFETY: the range is only dereferenced inside the deferred closure,
    // after SMR has proven the pages unreachable.
    unsafe impl Send for Range {}

    let page_manager = Arc::clone(page_manager);
    let range = Range(begin, end);
    smr::invoke(move || {
        let range = range;
        let mut page = range.0;
        while page != range.1 {
            let Some(current) = PagePtr::from_raw(page, page_manager.page_size()) else {
                break;
            };
            let next = current.header().next_page();
            // SAFETY: SMR drained every guard that could reach the page.
            unsafe { page_manager.free(current.as_raw_page()) };
            page = next;
        }
    });
}

/// Iterator over the pages of a log, in chain order.
pub struct PageIter<'g> {
    current: *mut LogPage,
    page_size: usize,
    _guard: PhantomData<&'g Guard>,
}

impl<'g> Iterator for PageIter<'g> {
    type Item = PageRef<'g>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = PagePtr::from_raw(self.current, self.page_size)?;
        self.current = page.header().next_page();
        Some(PageRef {
            page,
            _guard: PhantomData,
        })
    }
}

/// Borrowed view of one log page.
pub struct PageRef<'g> {
    page: PagePtr,
    _guard: PhantomData<&'g Guard>,
}

impl<'g> PageRef<'g> {
    pub fn is_sealed(&self) -> bool {
        self.page.header().offset_and_sealed().1
    }

    /// Acquired entries of this page, sealed or not, in slot order.
    pub fn entries(&self) -> impl Iterator<Item = EntryRef<'g>> {
        self.page.entries().map(EntryRef::new)
    }

    pub(crate) fn raw(&self) -> PagePtr {
        self.page
    }
}

pub(crate) struct PageEntryIter {
    page: PagePtr,
    offset: u32,
}

impl Iterator for PageEntryIter {
    type Item = EntryPtr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset as usize + LOG_ENTRY_HEADER_SIZE > self.page.page_size {
            return None;
        }
        let (live_offset, _) = self.page.header().offset_and_sealed();
        if self.offset >= live_offset {
            return None;
        }
        let entry = self.page.entry_at(self.offset);
        let (payload_size, _) = entry.header().size_and_sealed();
        if payload_size == 0 {
            return None;
        }
        self.offset += LogEntry::entry_size_for(payload_size);
        Some(entry)
    }
}
