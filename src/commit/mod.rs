//! # Commit Manager Surface
//!
//! The commit manager is an external collaborator: it owns the
//! commit-version clock and tracks in-flight transactions elsewhere. The
//! storage core consults it for exactly one value — the lowest active
//! version — which bounds what the delta-main GC may reclaim. This module
//! defines that consumed surface and nothing more.

/// Commit version, allocated by the external commit manager.
pub type Version = u64;

/// The one question the storage core asks the commit manager.
///
/// The GC driver polls this between passes and threads the answer
/// through `GarbageCollector::run` as a plain value.
pub trait CommitManager: Send + Sync {
    /// Smallest commit version any in-flight transaction may still read.
    ///
    /// Must be monotone non-decreasing and safe to call at any time.
    /// Versions strictly below the returned value are invisible to every
    /// present and future reader; the GC is free to reclaim them.
    fn lowest_active_version(&self) -> Version;
}
