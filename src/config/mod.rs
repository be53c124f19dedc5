//! # Storage Configuration
//!
//! Runtime configuration for the storage engine core. The layout constants
//! live in [`constants`]; this module holds the knobs an embedder chooses
//! at construction time: page size, pool size, and the GC interval.

pub mod constants;

pub use constants::*;

use eyre::{ensure, Result};
use std::time::Duration;

/// Configuration of the page pool and the GC driver.
///
/// All values are fixed at construction; the pool does not grow or shrink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Bytes per pool page. Must be a power of two within
    /// [`MIN_PAGE_SIZE`]..=[`MAX_PAGE_SIZE`].
    pub page_size: usize,
    /// Total number of pages in the pool.
    pub pool_pages: usize,
    /// Sleep between GC passes.
    pub gc_interval: Duration,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size.is_power_of_two(),
            "page_size must be a power of two, got {}",
            self.page_size
        );
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
            "page_size {} outside supported range {}..={}",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        ensure!(self.pool_pages >= 1, "pool must hold at least one page");
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_pages: DEFAULT_POOL_PAGES,
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StorageConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let config = StorageConfig {
            page_size: 3 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tiny_page_size() {
        let config = StorageConfig {
            page_size: 128,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_pool() {
        let config = StorageConfig {
            pool_pages: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
