//! # Delta-Main Store
//!
//! The delta-main format keeps each table's data in two tiers: a compact
//! *main* tier of multi-version records laid out densely in pages, and a
//! *delta* tier of freshly written versions buffered in the insert log.
//! A periodic garbage collection pass folds the delta into the main tier:
//! it rewrites main pages record by record, drops versions no active
//! reader can see, absorbs buffered versions, and repoints the hash index
//! at the new record homes.
//!
//! - [`record`]: the multi-version record format and its copy-and-compact
//!   rewrite step
//! - [`page`]: main pages and the per-page incremental GC
//! - [`insert_map`]: versions buffered between the insert log and the
//!   main tier

pub mod insert_map;
pub mod page;
pub mod record;

pub use insert_map::{InsertMap, PendingVersion};
pub use page::MainPage;
pub use record::{RecordView, VersionEntry};
