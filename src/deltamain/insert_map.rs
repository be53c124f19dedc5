//! Pending versions buffered between the insert log and the main store.
//!
//! The GC builds this map from sealed insert-log entries at the start of
//! a pass and drains it as records are placed: versions for keys that
//! already live in a main page are absorbed by `copy_and_compact`, the
//! rest are folded into fresh records at the end of the pass. Entries
//! that survive a pass (fill pages ran out) stay in the map and are
//! merged again next time; duplicates from re-scanned log pages are
//! dropped on insert.

use smallvec::SmallVec;

/// One buffered version of a key. An empty payload is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVersion {
    pub version: u64,
    pub payload: Box<[u8]>,
}

impl PendingVersion {
    pub fn new(version: u64, payload: &[u8]) -> Self {
        Self {
            version,
            payload: payload.into(),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            payload: Box::default(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

type VersionList = SmallVec<[PendingVersion; 2]>;

/// `key -> pending versions`, newest first.
#[derive(Default)]
pub struct InsertMap {
    entries: hashbrown::HashMap<u64, VersionList>,
}

impl InsertMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a version, keeping the per-key list sorted newest first.
    /// A version number already present for the key is dropped; it can
    /// only be a re-scan of the same log entry.
    pub fn insert(&mut self, key: u64, pending: PendingVersion) {
        let list = self.entries.entry(key).or_default();
        match list.binary_search_by(|existing| pending.version.cmp(&existing.version)) {
            Ok(_) => {}
            Err(at) => list.insert(at, pending),
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    /// Pending versions for `key`, newest first.
    pub fn get(&self, key: u64) -> Option<&[PendingVersion]> {
        self.entries.get(&key).map(|list| list.as_slice())
    }

    pub fn remove(&mut self, key: u64) -> Option<VersionList> {
        self.entries.remove(&key)
    }

    /// An arbitrary buffered key, used to drain the map.
    pub fn any_key(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
