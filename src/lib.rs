//! # tidestore - Main-Memory Multi-Version Storage Core
//!
//! tidestore is the storage engine core of a distributed, main-memory,
//! multi-version key-value store: durable-in-memory tables whose record
//! keys carry ordered version histories, coordinated by a monotonically
//! increasing commit-version clock. This crate implements the two hard
//! pieces: the lock-free append-only paged log and the delta-main page
//! garbage collector that rebuilds pages, reclaims obsolete versions, and
//! folds buffered writes into the main store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  TableManager / GC driver                  │◄── CommitManager
//! ├────────────────────────────────────────────┤    (external,
//! │  Table (index, insert log, main page set)  │    lowest active
//! ├────────────────────────────────────────────┤    version only)
//! │  Delta-Main GC (record rewrite, insert     │
//! │  folding, index repointing)                │
//! ├────────────────────────────────────────────┤
//! │  Log (ordered / unordered, lock-free       │
//! │  slot acquisition, sealed prefix)          │
//! ├──────────────────────┬─────────────────────┤
//! │  Page pool (arena,   │  SMR (epoch-based   │
//! │  lock-free stack)    │  deferred free)     │
//! └──────────────────────┴─────────────────────┘
//! ```
//!
//! ## Design Pillars
//!
//! - **Lock-free hot path**: appends race for page slots with a single
//!   CAS on the entry size word; heads, tails, and the sealed prefix all
//!   advance through atomics.
//! - **Safe reclamation**: every free of a shared page is deferred
//!   through epoch guards, so paused scanners never observe recycled
//!   memory.
//! - **Version visibility across GC**: the page-rewriting collector keeps
//!   every version at or above the lowest active version reachable
//!   through the hash index at every moment.
//!
//! ## Quick Start
//!
//! The commit manager lives outside the crate; the core only asks it for
//! the lowest active version.
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidestore::{CommitManager, StorageConfig, TableManager};
//!
//! struct Watermark;
//! impl CommitManager for Watermark {
//!     fn lowest_active_version(&self) -> u64 {
//!         1
//!     }
//! }
//!
//! let manager = TableManager::new(StorageConfig::default(), Arc::new(Watermark))?;
//! let id = manager.create_table()?;
//! let table = manager.table(id).unwrap();
//!
//! table.insert(42, 7, b"payload")?;
//! assert_eq!(table.get(42, 7).as_deref(), Some(&b"payload"[..]));
//! ```
//!
//! ## Module Overview
//!
//! - [`page`]: bounded page pool over one contiguous arena
//! - [`smr`]: epoch-based safe memory reclamation
//! - [`log`]: ordered and unordered append-only paged logs
//! - [`deltamain`]: multi-version records, main pages, and the GC rewrite
//! - [`index`]: sharded hash index from keys to record locations
//! - [`commit`]: the consumed commit-manager surface
//! - [`table`]: tables, the table registry, and the GC driver

#[macro_use]
mod macros;

pub mod commit;
pub mod config;
pub mod deltamain;
pub mod index;
pub mod log;
pub mod page;
pub mod smr;
pub mod table;

pub use commit::{CommitManager, Version};
pub use config::StorageConfig;
pub use deltamain::{InsertMap, PendingVersion, RecordView, VersionEntry};
pub use index::HashIndex;
pub use log::{EntryRef, Log, LogPosition, Ordered, OrderedLog, Unordered, UnorderedLog};
pub use page::PageManager;
pub use table::{GarbageCollector, Table, TableId, TableManager};
