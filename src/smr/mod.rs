//! # Safe Memory Reclamation
//!
//! Epoch-based deferred reclamation on top of `crossbeam-epoch`. Readers
//! that dereference shared page pointers pin the current epoch with
//! [`enter`]; writers that retire pages register the free through
//! [`invoke`], which runs the closure only after every guard that could
//! have observed the old pointers has been dropped.
//!
//! If the process dies before a deferred action runs, the pages leak.
//! That is acceptable: the store is main-memory only.

pub use crossbeam_epoch::Guard;

/// Pins the current epoch. Hold the guard for the duration of any
/// traversal over shared pages.
pub fn enter() -> Guard {
    crossbeam_epoch::pin()
}

/// Defers `action` until the current epoch has drained of guards.
pub fn invoke<F>(action: F)
where
    F: FnOnce() + Send + 'static,
{
    let guard = crossbeam_epoch::pin();
    guard.defer(action);
    guard.flush();
}

/// Drives the collector until previously deferred actions had a chance to
/// run. Intended for tests and shutdown paths; steady-state code relies on
/// the collector making progress as guards come and go.
pub fn drain() {
    for _ in 0..16 {
        let guard = crossbeam_epoch::pin();
        guard.flush();
        drop(guard);
    }
}
