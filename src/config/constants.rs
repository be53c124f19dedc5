//! # tidestore Configuration Constants
//!
//! This module centralizes the layout constants of the paged log and the
//! delta-main store. Constants that depend on each other are co-located to
//! prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_HEADER_SIZE (16 bytes)
//!       │
//!       ├─> ENTRY_PHASE (8 bytes)
//!       │     Entry headers are placed on a 16-byte grid shifted by 8
//!       │     bytes, so every entry header address satisfies
//!       │     addr % 16 == 8.
//!       │
//!       └─> FIRST_ENTRY_OFFSET (derived: PAGE_HEADER_SIZE + ENTRY_PHASE)
//!
//! LOG_ENTRY_HEADER_SIZE (16 bytes)
//!       │
//!       └─> Entry slot size = LOG_ENTRY_HEADER_SIZE + payload rounded
//!           up to ENTRY_ALIGNMENT. Slots stay on the shifted grid.
//!
//! DEFAULT_PAGE_SIZE (2 MiB)
//!       │
//!       ├─> Must be a power of two between MIN_PAGE_SIZE and
//!       │   MAX_PAGE_SIZE. Page offsets are stored shifted left by one
//!       │   inside a u32, so MAX_PAGE_SIZE is bounded by 2^30.
//!       │
//!       └─> MAIN_PAGE_HEADER_SIZE (16 bytes, delta-main pages)
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `FIRST_ENTRY_OFFSET % 16 == ENTRY_PHASE` (entry headers land on the
//!    shifted grid)
//! 2. `LOG_ENTRY_HEADER_SIZE` and `ENTRY_ALIGNMENT` keep successive slots
//!    on the same grid
//! 3. `DEFAULT_PAGE_SIZE` respects the `MIN`/`MAX` page bounds

// ============================================================================
// LOG PAGE LAYOUT
// These define the fundamental page structure used by both log variants
// ============================================================================

/// Size of the log page header in bytes.
/// Bytes 0..8 hold the offset word (next free byte << 1 | open bit),
/// bytes 8..16 the pointer to the next page in the chain.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Byte phase applied to the entry grid.
/// Pages are 16-byte aligned, so shifting the first entry by 8 bytes puts
/// every entry header at an address with `addr % 16 == 8` and every entry
/// payload of an entry with a 16-byte header back on a 16-byte boundary.
pub const ENTRY_PHASE: usize = 8;

/// Byte offset of the first log entry within a page.
pub const FIRST_ENTRY_OFFSET: usize = PAGE_HEADER_SIZE + ENTRY_PHASE;

/// Size of a log entry header in bytes.
/// Bytes 0..4 hold the size word, bytes 4..8 the entry type, the rest is
/// reserved.
pub const LOG_ENTRY_HEADER_SIZE: usize = 16;

/// Alignment of log entry slots. Entry slots are multiples of this, so all
/// entry headers share the same 16-byte grid phase.
pub const ENTRY_ALIGNMENT: usize = 16;

const _: () = assert!(
    FIRST_ENTRY_OFFSET % ENTRY_ALIGNMENT == ENTRY_PHASE,
    "first entry must start on the shifted 16-byte grid"
);

const _: () = assert!(
    LOG_ENTRY_HEADER_SIZE % ENTRY_ALIGNMENT == 0,
    "entry header must keep slots on the 16-byte grid"
);

// ============================================================================
// PAGE POOL CONFIGURATION
// ============================================================================

/// Default size of each pool page in bytes (2 MiB).
pub const DEFAULT_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Smallest supported page size. Below this a page cannot hold its header
/// plus a single minimum-size log entry.
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest supported page size. Page offsets are stored shifted left by
/// one bit inside a u32 word.
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// Default number of pages in the pool (128 MiB with default pages).
pub const DEFAULT_POOL_PAGES: usize = 64;

const _: () = assert!(
    DEFAULT_PAGE_SIZE.is_power_of_two()
        && DEFAULT_PAGE_SIZE >= MIN_PAGE_SIZE
        && DEFAULT_PAGE_SIZE <= MAX_PAGE_SIZE,
    "DEFAULT_PAGE_SIZE out of bounds"
);

const _: () = assert!(
    MIN_PAGE_SIZE >= FIRST_ENTRY_OFFSET + LOG_ENTRY_HEADER_SIZE + ENTRY_ALIGNMENT,
    "MIN_PAGE_SIZE cannot hold a single log entry"
);

// ============================================================================
// DELTA-MAIN LAYOUT
// ============================================================================

/// Size of the delta-main page header in bytes.
/// Bytes 0..8 hold the used byte count, bytes 8..12 the incremental GC
/// cursor, bytes 12..16 the deletion marker.
pub const MAIN_PAGE_HEADER_SIZE: usize = 16;

/// Alignment of records within a delta-main page.
pub const RECORD_ALIGNMENT: usize = 8;

const _: () = assert!(
    MAIN_PAGE_HEADER_SIZE % RECORD_ALIGNMENT == 0,
    "records must start aligned after the main page header"
);

// ============================================================================
// GARBAGE COLLECTION
// ============================================================================

/// Default sleep between GC passes in seconds.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 1;

/// Slice in which the GC driver thread polls the shutdown flag while
/// sleeping between passes.
pub const GC_SHUTDOWN_POLL_MILLIS: u64 = 20;

// ============================================================================
// CONCURRENCY LIMITS
// ============================================================================

/// Number of shards of the hash index.
pub const INDEX_SHARD_COUNT: usize = 64;
