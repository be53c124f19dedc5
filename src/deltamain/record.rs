//! # Multi-Version Records
//!
//! A record stores the full version history of one key inside a main
//! page, newest version first. The GC rewrites records with
//! `copy_and_compact`, which drops versions no active reader can see and
//! absorbs pending versions buffered in the insert map.
//!
//! ## Binary Layout
//!
//! ```text
//! +-------------+----------+---------+
//! | VersionCnt  | Reserved | Key     |
//! | (4 bytes)   | (4 bytes)| (8 B)   |
//! +-------------+----------+---------+
//! | versions: [u64; n]    newest first
//! +----------------------------------+
//! | offsets:  [u32; n + 1]           |
//! | <pad to 8 bytes>                 |
//! +----------------------------------+
//! | payloads: offsets[i]..offsets[i+1]
//! |           is version i's payload |
//! +----------------------------------+
//! ```
//!
//! Offsets are record-relative. An empty payload range is a tombstone.
//! The record's total size is `offsets[n]` rounded up to 8 bytes, so
//! records can be walked without an external length.
//!
//! ## Zero-Copy Design
//!
//! Reads go through [`RecordView`], which borrows the page bytes
//! directly. The fixed header uses zerocopy little-endian fields; the
//! variable tail is parsed manually because its position depends on the
//! version count.

use super::insert_map::PendingVersion;
use crate::config::RECORD_ALIGNMENT;
use std::ptr::NonNull;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RecordHeader {
    version_count: U32,
    reserved: U32,
    key: U64,
}

impl RecordHeader {
    pub const SIZE: usize = 16;

    zerocopy_accessors! {
        version_count: u32 as U32,
        key: u64 as U64,
    }
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RecordHeader::SIZE);

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap()) // INVARIANT: callers stay in bounds
}

#[inline]
fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap()) // INVARIANT: callers stay in bounds
}

/// One version of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEntry<'a> {
    pub version: u64,
    pub payload: &'a [u8],
}

impl<'a> VersionEntry<'a> {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Borrowed view of a record inside a main page.
#[derive(Clone, Copy)]
pub struct RecordView<'a> {
    data: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Parses a record at the start of `data`. The slice may extend past
    /// the record; [`size`](Self::size) reports where it ends.
    pub fn parse(data: &'a [u8]) -> Self {
        assert!(data.len() >= RecordHeader::SIZE, "record header truncated");
        let view = Self { data };
        let count = view.version_count() as usize;
        assert!(count >= 1, "record without versions");
        assert!(
            view.size() <= data.len(),
            "record extends past its page region"
        );
        view
    }

    /// Builds a view from a raw record address, typically one resolved
    /// through the hash index.
    ///
    /// # Safety
    ///
    /// `ptr` must address a well-formed record, and the caller must hold
    /// an SMR guard entered before the pointer was resolved.
    pub unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        let header = std::slice::from_raw_parts(ptr.as_ptr(), RecordHeader::SIZE);
        let count = read_u32(header, 0) as usize;
        debug_assert!(count >= 1, "record without versions");
        let end_offset_at = RecordHeader::SIZE + count * 8 + count * 4;
        let end = read_u32(
            std::slice::from_raw_parts(ptr.as_ptr(), end_offset_at + 4),
            end_offset_at,
        );
        let size = round_up(end as usize, RECORD_ALIGNMENT);
        Self {
            data: std::slice::from_raw_parts(ptr.as_ptr(), size),
        }
    }

    fn header(&self) -> &RecordHeader {
        RecordHeader::ref_from_bytes(&self.data[..RecordHeader::SIZE])
            .expect("header size is statically correct")
    }

    pub fn key(&self) -> u64 {
        self.header().key()
    }

    pub fn version_count(&self) -> u32 {
        self.header().version_count()
    }

    fn version_at(&self, idx: usize) -> u64 {
        read_u64(self.data, RecordHeader::SIZE + idx * 8)
    }

    fn offset_at(&self, idx: usize) -> u32 {
        let base = RecordHeader::SIZE + self.version_count() as usize * 8;
        read_u32(self.data, base + idx * 4)
    }

    /// Total bytes occupied by this record within its page.
    pub fn size(&self) -> usize {
        round_up(
            self.offset_at(self.version_count() as usize) as usize,
            RECORD_ALIGNMENT,
        )
    }

    /// Versions of this record, newest first.
    pub fn versions(&self) -> impl Iterator<Item = VersionEntry<'a>> + '_ {
        (0..self.version_count() as usize).map(move |idx| VersionEntry {
            version: self.version_at(idx),
            payload: &self.data[self.offset_at(idx) as usize..self.offset_at(idx + 1) as usize],
        })
    }

    /// Newest version visible at `snapshot`, tombstones included.
    pub fn newest_visible(&self, snapshot: u64) -> Option<VersionEntry<'a>> {
        self.versions().find(|entry| entry.version <= snapshot)
    }

    /// Whether a GC pass at `lowest_active_version` would change this
    /// record: some stored version fell below the watermark, or the
    /// insert map buffers new versions for its key.
    pub fn needs_cleaning(
        &self,
        lowest_active_version: u64,
        insert_map: &super::InsertMap,
    ) -> bool {
        if insert_map.contains(self.key()) {
            return true;
        }
        let oldest = self.version_at(self.version_count() as usize - 1);
        oldest < lowest_active_version
    }

    /// Rewrites this record into `dst`, dropping versions below
    /// `lowest_active_version` and merging in `pending` versions (newest
    /// first, from the insert map).
    ///
    /// Returns the bytes written: `Some(0)` means nothing survived and
    /// the record disappears; `None` means `dst` is too small and the
    /// caller must relocate into a fresh fill page.
    pub fn copy_and_compact(
        &self,
        lowest_active_version: u64,
        pending: Option<&[PendingVersion]>,
        dst: &mut [u8],
    ) -> Option<usize> {
        let mut merged: Vec<(u64, &[u8])> = Vec::new();

        // Merge the two descending lists, preferring the buffered copy on
        // equal versions (it can only be a re-scan of the same write).
        let pending = pending.unwrap_or(&[]);
        let mut buffered = pending.iter().peekable();
        let mut stored = self.versions().peekable();
        loop {
            let next_buffered = buffered.peek().map(|p| p.version);
            let next_stored = stored.peek().map(|s| s.version);
            let take_pending = match (next_buffered, next_stored) {
                (Some(b), Some(s)) => {
                    if b == s {
                        stored.next();
                    }
                    b >= s
                }
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_pending {
                let p = buffered.next().expect("peeked");
                merged.push((p.version, &*p.payload));
            } else {
                let s = stored.next().expect("peeked");
                merged.push((s.version, s.payload));
            }
        }
        merged.retain(|&(version, _)| version >= lowest_active_version);

        if merged.is_empty() {
            return Some(0);
        }
        let size = record_size(&merged);
        if size > dst.len() {
            return None;
        }
        Some(write_record(self.key(), &merged, dst))
    }
}

impl std::fmt::Debug for RecordView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordView")
            .field("key", &self.key())
            .field("version_count", &self.version_count())
            .field("size", &self.size())
            .finish()
    }
}

/// Bytes needed to store a record with the given versions.
pub fn record_size(versions: &[(u64, &[u8])]) -> usize {
    let count = versions.len();
    let tables = RecordHeader::SIZE + count * 8 + (count + 1) * 4;
    let payloads: usize = versions.iter().map(|(_, payload)| payload.len()).sum();
    round_up(round_up(tables, RECORD_ALIGNMENT) + payloads, RECORD_ALIGNMENT)
}

/// Serializes a record. `versions` must be sorted newest first and
/// non-empty; `dst` must hold [`record_size`] bytes. Returns the bytes
/// written.
pub fn write_record(key: u64, versions: &[(u64, &[u8])], dst: &mut [u8]) -> usize {
    debug_assert!(!versions.is_empty(), "record without versions");
    debug_assert!(
        versions.windows(2).all(|w| w[0].0 > w[1].0),
        "versions must be strictly descending"
    );
    let size = record_size(versions);
    assert!(dst.len() >= size, "destination too small for record");

    let count = versions.len();
    let header = RecordHeader::mut_from_bytes(&mut dst[..RecordHeader::SIZE])
        .expect("header size is statically correct");
    header.set_version_count(count as u32);
    header.set_key(key);
    header.reserved = U32::new(0);

    let mut at = RecordHeader::SIZE;
    for &(version, _) in versions {
        dst[at..at + 8].copy_from_slice(&version.to_le_bytes());
        at += 8;
    }

    let data_start = round_up(at + (count + 1) * 4, RECORD_ALIGNMENT);
    let mut payload_at = data_start;
    for &(_, payload) in versions {
        dst[at..at + 4].copy_from_slice(&(payload_at as u32).to_le_bytes());
        at += 4;
        payload_at += payload.len();
    }
    dst[at..at + 4].copy_from_slice(&(payload_at as u32).to_le_bytes());
    at += 4;

    // Zero the alignment gap between the offset table and the payloads.
    dst[at..data_start].fill(0);
    let mut payload_at = data_start;
    for &(_, payload) in versions {
        dst[payload_at..payload_at + payload.len()].copy_from_slice(payload);
        payload_at += payload.len();
    }
    dst[payload_at..size].fill(0);

    size
}

/// Builds a record directly from buffered versions, used when the GC
/// folds inserts for keys that have no record yet. Versions below
/// `lowest_active_version` are dropped; `Some(0)` means nothing survived,
/// `None` means `dst` is too small.
pub fn build_from_pending(
    key: u64,
    pending: &[PendingVersion],
    lowest_active_version: u64,
    dst: &mut [u8],
) -> Option<usize> {
    let versions: Vec<(u64, &[u8])> = pending
        .iter()
        .filter(|p| p.version >= lowest_active_version)
        .map(|p| (p.version, &*p.payload))
        .collect();
    if versions.is_empty() {
        return Some(0);
    }
    let size = record_size(&versions);
    if size > dst.len() {
        return None;
    }
    Some(write_record(key, &versions, dst))
}
