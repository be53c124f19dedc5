//! # Table Manager
//!
//! Owns the page pool, the table registry, and the background GC driver.
//! The driver thread wakes every `gc_interval`, asks the external commit
//! manager for the lowest active version, and runs a GC pass over every
//! table. On shutdown it finishes the pass in flight and joins.
//!
//! Table identity is an opaque [`TableId`]; mapping names to ids is the
//! business of the external naming layer, not of this crate.

use super::{Table, TableId};
use crate::commit::CommitManager;
use crate::config::{StorageConfig, GC_SHUTDOWN_POLL_MILLIS};
use crate::page::PageManager;
use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs delta-main GC passes over a set of tables.
pub struct GarbageCollector;

impl GarbageCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, tables: &[Arc<Table>], lowest_active_version: u64) {
        for table in tables {
            table.run_gc(lowest_active_version);
            tracing::debug!(
                table = table.id(),
                lowest_active_version,
                "gc pass finished"
            );
        }
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

struct ManagerShared {
    page_manager: Arc<PageManager>,
    commit_manager: Arc<dyn CommitManager>,
    gc: GarbageCollector,
    tables: RwLock<Vec<Arc<Table>>>,
    shutdown: AtomicBool,
}

/// Registry of tables plus the background GC driver.
pub struct TableManager {
    shared: Arc<ManagerShared>,
    gc_thread: Option<JoinHandle<()>>,
}

impl TableManager {
    /// Creates the manager around an externally provided commit manager,
    /// which the GC driver consults for the lowest active version.
    pub fn new(config: StorageConfig, commit_manager: Arc<dyn CommitManager>) -> Result<Self> {
        config.validate()?;
        let page_manager = PageManager::new(config.page_size, config.pool_pages)?;

        let shared = Arc::new(ManagerShared {
            page_manager,
            commit_manager,
            gc: GarbageCollector::new(),
            tables: RwLock::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let gc_thread = {
            let shared = Arc::clone(&shared);
            let interval = config.gc_interval;
            std::thread::Builder::new()
                .name("tidestore-gc".to_string())
                .spawn(move || gc_loop(shared, interval))
                .wrap_err("failed to spawn the gc driver thread")?
        };

        Ok(Self {
            shared,
            gc_thread: Some(gc_thread),
        })
    }

    /// Creates a table and returns its id.
    pub fn create_table(&self) -> Result<TableId> {
        let mut tables = self.shared.tables.write();
        let id = tables.len() as TableId + 1;
        let table = Arc::new(Table::new(id, Arc::clone(&self.shared.page_manager))?);
        tables.push(table);
        tracing::debug!(table = id, "table created");
        Ok(id)
    }

    pub fn table(&self, id: TableId) -> Option<Arc<Table>> {
        let tables = self.shared.tables.read();
        tables.get(id.checked_sub(1)? as usize).cloned()
    }

    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.shared.page_manager
    }

    /// Runs one synchronous GC pass over all tables, outside the driver's
    /// schedule.
    pub fn run_gc_now(&self) {
        let tables: Vec<Arc<Table>> = self.shared.tables.read().clone();
        let lowest = self.shared.commit_manager.lowest_active_version();
        self.shared.gc.run(&tables, lowest);
    }
}

impl Drop for TableManager {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.gc_thread.take() {
            let _ = thread.join();
        }
    }
}

fn gc_loop(shared: Arc<ManagerShared>, interval: Duration) {
    let poll = Duration::from_millis(GC_SHUTDOWN_POLL_MILLIS);
    loop {
        // Sleep in small slices so shutdown never waits a full interval.
        let mut slept = Duration::ZERO;
        while slept < interval {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let chunk = poll.min(interval - slept);
            std::thread::sleep(chunk);
            slept += chunk;
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let tables: Vec<Arc<Table>> = shared.tables.read().clone();
        let lowest = shared.commit_manager.lowest_active_version();
        shared.gc.run(&tables, lowest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Commit-manager stand-in; the tests move the watermark by hand.
    struct TestWatermark(AtomicU64);

    impl TestWatermark {
        fn new(initial: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(initial)))
        }

        fn raise(&self, version: u64) {
            self.0.store(version, Ordering::SeqCst);
        }
    }

    impl CommitManager for TestWatermark {
        fn lowest_active_version(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn test_config() -> StorageConfig {
        StorageConfig {
            page_size: 4096,
            pool_pages: 16,
            // Keep the driver quiet; tests trigger GC explicitly.
            gc_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn create_and_resolve_tables() {
        let manager = TableManager::new(test_config(), TestWatermark::new(1)).unwrap();
        let first = manager.create_table().unwrap();
        let second = manager.create_table().unwrap();

        assert_ne!(first, second);
        assert_eq!(manager.table(first).unwrap().id(), first);
        assert_eq!(manager.table(second).unwrap().id(), second);
        assert!(manager.table(0).is_none());
        assert!(manager.table(99).is_none());
    }

    #[test]
    fn gc_consults_the_external_watermark() {
        let watermark = TestWatermark::new(1);
        let manager =
            TableManager::new(test_config(), Arc::clone(&watermark) as Arc<dyn CommitManager>)
                .unwrap();
        let id = manager.create_table().unwrap();
        let table = manager.table(id).unwrap();

        table.insert(1, 1, b"old").unwrap();
        table.insert(1, 2, b"new").unwrap();

        // At watermark 1 every version survives the fold.
        manager.run_gc_now();
        assert_eq!(table.get(1, 1).unwrap(), b"old");
        assert_eq!(table.get(1, 2).unwrap(), b"new");

        // Raising the watermark makes the old version collectible.
        watermark.raise(2);
        manager.run_gc_now();
        assert_eq!(table.get(1, 2).unwrap(), b"new");
        assert_eq!(table.get(1, 1), None);
    }

    #[test]
    fn shutdown_joins_the_driver_thread() {
        let manager = TableManager::new(
            StorageConfig {
                gc_interval: Duration::from_millis(50),
                ..test_config()
            },
            TestWatermark::new(1),
        )
        .unwrap();
        manager.create_table().unwrap();
        std::thread::sleep(Duration::from_millis(120));
        drop(manager);
    }
}
