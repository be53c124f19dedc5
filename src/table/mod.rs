//! # Tables
//!
//! A table ties the core pieces together: fresh writes land in an
//! unordered *insert log*, reads resolve through the hash index into the
//! delta-main page set, and the periodic GC pass folds the log into the
//! main tier.
//!
//! ## Data Flow
//!
//! ```text
//!  insert/remove ──► insert log (unordered, lock-free)
//!                         │  collect sealed entries
//!                         ▼
//!                    insert map ──► GC rewrite ──► main pages
//!                                        │             ▲
//!                                        └── repoints ─┘
//!                                            hash index
//! ```
//!
//! Readers never block writers: `get` pins an epoch, consults the index
//! and the not-yet-folded tail of the insert log, and picks the newest
//! version visible at its snapshot.

pub mod manager;

use crate::deltamain::page::{fill_with_inserts, FillState, MainPage, PageGcOutcome};
use crate::deltamain::{InsertMap, PendingVersion, RecordView};
use crate::index::HashIndex;
use crate::log::{EntryRef, Log, PagePtr, Unordered, UnorderedLog};
use crate::page::PageManager;
use crate::smr::{self, Guard};
use eyre::{ensure, eyre, Result};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use manager::{GarbageCollector, TableManager};

/// Identifier a table gets from the [`TableManager`].
pub type TableId = u64;

/// Entry type of a buffered write carrying a value.
const DELTA_TYPE_INSERT: u32 = 1;
/// Entry type of a buffered deletion.
const DELTA_TYPE_TOMBSTONE: u32 = 2;
/// Key and version prefix of every insert-log entry.
const DELTA_META_SIZE: usize = 16;

pub struct Table {
    id: TableId,
    page_manager: Arc<PageManager>,
    index: HashIndex,
    insert_log: UnorderedLog,
    /// Pending versions between collection and folding. Survivors of a
    /// pass (fill pages ran out) stay buffered for the next one.
    insert_map: Mutex<InsertMap>,
    /// Current main page set. The lock also serializes GC passes.
    pages: Mutex<Vec<MainPage>>,
    /// Watermark of the last completed GC pass. Versions below it were
    /// deliberately reclaimed; reads skip them even if their bytes still
    /// sit in a not-yet-erased log page.
    gc_watermark: AtomicU64,
}

impl Table {
    pub(crate) fn new(id: TableId, page_manager: Arc<PageManager>) -> Result<Self> {
        let insert_log = Log::<Unordered>::new(Arc::clone(&page_manager))?;
        Ok(Self {
            id,
            page_manager,
            index: HashIndex::new(),
            insert_log,
            insert_map: Mutex::new(InsertMap::new()),
            pages: Mutex::new(Vec::new()),
            gc_watermark: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    /// Writes a new version of `key`. The write is immediately visible to
    /// snapshots at or above `version`; the GC folds it into the main
    /// tier later.
    pub fn insert(&self, key: u64, version: u64, value: &[u8]) -> Result<()> {
        ensure!(
            !value.is_empty(),
            "empty values are reserved for tombstones"
        );
        self.append_delta(key, version, value, DELTA_TYPE_INSERT)
    }

    /// Deletes `key` at `version` by writing a tombstone.
    pub fn remove(&self, key: u64, version: u64) -> Result<()> {
        self.append_delta(key, version, &[], DELTA_TYPE_TOMBSTONE)
    }

    fn append_delta(&self, key: u64, version: u64, value: &[u8], entry_type: u32) -> Result<()> {
        let size = (DELTA_META_SIZE + value.len()) as u32;
        let entry = self
            .insert_log
            .append(size, entry_type)
            .ok_or_else(|| eyre!("page pool exhausted while appending to table {}", self.id))?;
        entry.write_payload_at(0, &key.to_le_bytes());
        entry.write_payload_at(8, &version.to_le_bytes());
        entry.write_payload_at(DELTA_META_SIZE, value);
        self.insert_log.seal(&entry);
        Ok(())
    }

    /// Newest value of `key` visible at `snapshot`, or `None` if the key
    /// is absent or deleted there.
    ///
    /// The three sources are consulted in the direction a version travels
    /// (log, then buffer, then index): the GC publishes a fold through
    /// the index before it erases the log pages it consumed, so a version
    /// that disappears from an earlier source is already visible in a
    /// later one.
    pub fn get(&self, key: u64, snapshot: u64) -> Option<Vec<u8>> {
        let guard = smr::enter();
        let watermark = self.gc_watermark.load(Ordering::Acquire);

        // (version, Some(value) | None for tombstone)
        let mut best: Option<(u64, Option<Vec<u8>>)> = None;

        // Writes still sitting in the insert log. Versions below the GC
        // watermark were reclaimed; their leftover bytes do not count.
        for page in self.insert_log.pages(&guard) {
            for entry in page.entries() {
                if !entry.is_sealed() {
                    continue;
                }
                let (entry_key, version, value) = decode_delta(&entry);
                if entry_key != key || version > snapshot || version < watermark {
                    continue;
                }
                if best.as_ref().map_or(true, |&(v, _)| version > v) {
                    let value =
                        (entry.entry_type() == DELTA_TYPE_INSERT).then(|| value.to_vec());
                    best = Some((version, value));
                }
            }
        }

        // Versions buffered by an earlier GC pass but not folded yet.
        {
            let map = self.insert_map.lock();
            if let Some(list) = map.get(key) {
                if let Some(pending) = list
                    .iter()
                    .find(|p| p.version <= snapshot && p.version >= watermark)
                {
                    if best.as_ref().map_or(true, |&(v, _)| pending.version > v) {
                        let value = (!pending.is_tombstone()).then(|| pending.payload.to_vec());
                        best = Some((pending.version, value));
                    }
                }
            }
        }

        if let Some(ptr) = self.index.get(key) {
            // SAFETY: the guard above keeps the record's page alive.
            let record = unsafe { RecordView::from_ptr(ptr) };
            if let Some(entry) = record.newest_visible(snapshot) {
                if best.as_ref().map_or(true, |&(v, _)| entry.version > v) {
                    let value = (!entry.is_tombstone()).then(|| entry.payload.to_vec());
                    best = Some((entry.version, value));
                }
            }
        }

        best.and_then(|(_, value)| value)
    }

    /// Number of pages currently in the main tier.
    pub fn main_page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Number of keys resolvable through the hash index.
    pub fn indexed_keys(&self) -> usize {
        self.index.len()
    }

    /// One full GC pass over this table: collect sealed insert-log
    /// entries, rewrite main pages that need it, fold the remaining
    /// inserts, retire replaced pages through SMR, and drop fully
    /// consumed insert-log pages.
    pub fn run_gc(&self, lowest_active_version: u64) {
        let guard = smr::enter();
        // The page list lock doubles as the per-table GC lock.
        let mut pages = self.pages.lock();
        let mut insert_map = self.insert_map.lock();

        let erase_from = self.collect_inserts(lowest_active_version, &mut insert_map, &guard);

        let mut kept: Vec<MainPage> = Vec::with_capacity(pages.len() + 1);
        let mut doomed: Vec<MainPage> = Vec::new();
        let mut fill: Option<FillState> = None;
        let mut aborted = false;

        for page in pages.iter().copied() {
            if aborted {
                kept.push(page);
                continue;
            }
            loop {
                match page.gc(
                    lowest_active_version,
                    &mut insert_map,
                    &self.index,
                    &mut fill,
                    &self.page_manager,
                ) {
                    PageGcOutcome::Clean => {
                        kept.push(page);
                        break;
                    }
                    PageGcOutcome::Done => {
                        doomed.push(page);
                        break;
                    }
                    PageGcOutcome::FillExhausted => {
                        let completed = fill.take().expect("exhausted fill page exists");
                        kept.push(completed.finalize());
                        // Loop: the same source page resumes into a fresh
                        // fill page.
                    }
                    PageGcOutcome::OutOfPages => {
                        tracing::warn!(
                            table = self.id,
                            "gc pass stopped early: page pool exhausted"
                        );
                        // Unrelocated records still resolve into this
                        // page; keep it for the next pass.
                        kept.push(page);
                        aborted = true;
                        break;
                    }
                }
            }
        }

        if !aborted {
            loop {
                match fill_with_inserts(
                    lowest_active_version,
                    &mut insert_map,
                    &self.index,
                    &mut fill,
                    &self.page_manager,
                ) {
                    PageGcOutcome::Done => break,
                    PageGcOutcome::FillExhausted => {
                        let completed = fill.take().expect("exhausted fill page exists");
                        kept.push(completed.finalize());
                    }
                    PageGcOutcome::OutOfPages => {
                        tracing::warn!(
                            table = self.id,
                            "insert folding stopped early: page pool exhausted"
                        );
                        break;
                    }
                    PageGcOutcome::Clean => unreachable!("insert folding never reports clean"),
                }
            }
        }

        match fill {
            Some(state) if state.is_empty() => state.discard(&self.page_manager),
            Some(state) => kept.push(state.finalize()),
            None => {}
        }

        *pages = kept;
        self.gc_watermark
            .store(lowest_active_version, Ordering::Release);
        drop(insert_map);

        // Replaced source pages go back to the pool once every reader
        // that could still resolve into them is gone.
        if !doomed.is_empty() {
            let page_manager = Arc::clone(&self.page_manager);
            let addresses: Vec<usize> = doomed
                .iter()
                .map(|page| page.as_raw_page().as_ptr() as usize)
                .collect();
            smr::invoke(move || {
                for address in addresses {
                    // SAFETY: SMR drained every guard that could reach the
                    // page, and the index stopped referencing it before it
                    // was retired.
                    unsafe { page_manager.free(NonNull::new_unchecked(address as *mut u8)) };
                }
            });
        }

        // Insert-log pages whose entries are all collected and folded are
        // dropped wholesale; `erase_from` is the newest page that must
        // stay.
        if let Some(keep_from) = erase_from {
            self.insert_log.variant().erase(keep_from, None);
        }
    }

    /// Builds the insert map from sealed insert-log entries. Entries
    /// below the watermark are dead, and entries whose version already
    /// lives in the indexed record are re-scans of folded writes; both
    /// are skipped. Returns the newest page that must survive the
    /// post-fold erase, i.e. the oldest page that is still open or
    /// carries an unsealed entry.
    fn collect_inserts(
        &self,
        lowest_active_version: u64,
        insert_map: &mut InsertMap,
        guard: &Guard,
    ) -> Option<PagePtr> {
        let mut oldest_blocked: Option<PagePtr> = None;
        let mut newest_page: Option<PagePtr> = None;

        for page in self.insert_log.pages(guard) {
            if newest_page.is_none() {
                newest_page = Some(page.raw());
            }
            let mut blocked = !page.is_sealed();
            for entry in page.entries() {
                if !entry.is_sealed() {
                    blocked = true;
                    continue;
                }
                let (key, version, value) = decode_delta(&entry);
                if version < lowest_active_version {
                    continue;
                }
                if let Some(ptr) = self.index.get(key) {
                    // SAFETY: covered by the pass guard.
                    let record = unsafe { RecordView::from_ptr(ptr) };
                    if record.versions().any(|v| v.version == version) {
                        continue;
                    }
                }
                let pending = if entry.entry_type() == DELTA_TYPE_TOMBSTONE {
                    PendingVersion::tombstone(version)
                } else {
                    PendingVersion::new(version, value)
                };
                insert_map.insert(key, pending);
            }
            if blocked {
                oldest_blocked = Some(page.raw());
            }
        }

        // The write head is normally open and therefore blocked; if every
        // scanned page happens to be sealed and consumed, keep the newest
        // one so the head pointer stays valid.
        oldest_blocked.or(newest_page)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // SMR guarantees nobody references the table once it is dropped;
        // the main pages can go back to the pool directly. The insert log
        // returns its own pages.
        let pages = self.pages.get_mut();
        for page in pages.drain(..) {
            unsafe { self.page_manager.free(page.as_raw_page()) };
        }
    }
}

fn decode_delta<'a>(entry: &EntryRef<'a>) -> (u64, u64, &'a [u8]) {
    let payload = entry.payload();
    debug_assert!(payload.len() >= DELTA_META_SIZE, "malformed delta entry");
    let key = u64::from_le_bytes(payload[0..8].try_into().unwrap()); // INVARIANT: length asserted above
    let version = u64::from_le_bytes(payload[8..16].try_into().unwrap()); // INVARIANT: length asserted above
    (key, version, &payload[DELTA_META_SIZE..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table(page_size: usize, pool_pages: usize) -> Table {
        let page_manager = PageManager::new(page_size, pool_pages).unwrap();
        Table::new(1, page_manager).unwrap()
    }

    #[test]
    fn unfolded_writes_are_visible() {
        let table = test_table(4096, 8);
        table.insert(1, 5, b"alpha").unwrap();
        table.insert(1, 9, b"beta").unwrap();

        assert_eq!(table.get(1, 4), None);
        assert_eq!(table.get(1, 5).unwrap(), b"alpha");
        assert_eq!(table.get(1, 8).unwrap(), b"alpha");
        assert_eq!(table.get(1, 9).unwrap(), b"beta");
    }

    #[test]
    fn tombstone_hides_older_versions() {
        let table = test_table(4096, 8);
        table.insert(2, 3, b"value").unwrap();
        table.remove(2, 7).unwrap();

        assert_eq!(table.get(2, 5).unwrap(), b"value");
        assert_eq!(table.get(2, 8), None);
    }

    #[test]
    fn gc_folds_writes_into_main_pages() {
        let table = test_table(4096, 8);
        table.insert(1, 5, b"one").unwrap();
        table.insert(2, 6, b"two").unwrap();

        table.run_gc(2);

        assert_eq!(table.main_page_count(), 1);
        assert_eq!(table.indexed_keys(), 2);
        assert_eq!(table.get(1, 10).unwrap(), b"one");
        assert_eq!(table.get(2, 10).unwrap(), b"two");
    }

    #[test]
    fn reads_stay_consistent_across_folding() {
        let table = test_table(4096, 8);
        table.insert(1, 5, b"before").unwrap();
        table.run_gc(2);
        table.insert(1, 9, b"after").unwrap();

        // One version folded, one still in the log.
        assert_eq!(table.get(1, 7).unwrap(), b"before");
        assert_eq!(table.get(1, 9).unwrap(), b"after");

        table.run_gc(2);
        assert_eq!(table.get(1, 7).unwrap(), b"before");
        assert_eq!(table.get(1, 9).unwrap(), b"after");
    }

    #[test]
    fn gc_reclaims_versions_below_the_watermark() {
        let table = test_table(4096, 8);
        table.insert(1, 5, b"one").unwrap();
        table.insert(2, 3, b"two-old").unwrap();
        table.insert(2, 7, b"two-new").unwrap();
        table.run_gc(2);

        // Key 1 has nothing at or above the watermark; key 2 keeps v7.
        table.run_gc(6);

        assert_eq!(table.get(1, 10), None);
        assert_eq!(table.get(2, 10).unwrap(), b"two-new");
        assert_eq!(table.indexed_keys(), 1);
    }

    #[test]
    fn second_gc_pass_is_a_noop() {
        let table = test_table(4096, 8);
        table.insert(1, 5, b"one").unwrap();
        table.insert(2, 7, b"two").unwrap();

        table.run_gc(3);
        let pages_after_first = table.main_page_count();
        let keys_after_first = table.indexed_keys();

        table.run_gc(3);
        assert_eq!(table.main_page_count(), pages_after_first);
        assert_eq!(table.indexed_keys(), keys_after_first);
        assert_eq!(table.get(1, 10).unwrap(), b"one");
        assert_eq!(table.get(2, 10).unwrap(), b"two");
    }

    #[test]
    fn gc_returns_replaced_pages_to_the_pool() {
        let table = test_table(4096, 8);
        let pool = Arc::clone(&table.page_manager);

        for key in 0..8u64 {
            table.insert(key, 5 + key, &[0x42; 64]).unwrap();
        }
        table.run_gc(2);
        let available_after_fold = pool.available();

        // Rewriting with a higher watermark replaces the main page; the
        // old one must come back to the pool once the epoch drains.
        for key in 0..8u64 {
            table.insert(key, 40 + key, &[0x43; 64]).unwrap();
        }
        table.run_gc(30);
        smr::drain();

        assert!(pool.available() >= available_after_fold.saturating_sub(1));
        for key in 0..8u64 {
            assert_eq!(table.get(key, 100).unwrap(), &[0x43; 64]);
            assert_eq!(table.get(key, 20), None);
        }
    }
}
