//! # Unordered Log Integration Tests
//!
//! Covers chain splicing, append-chain adoption on rollover, page-level
//! erasure, and the sealed-bit skipping contract for readers.

use std::sync::Arc;
use tidestore::page::PageManager;
use tidestore::{smr, UnorderedLog};

#[test]
fn splicing_chains_prepends_them_to_the_page_walk() {
    let pool = PageManager::new(256, 8).unwrap();
    let log = UnorderedLog::new(Arc::clone(&pool)).unwrap();
    assert_eq!(log.page_count(), 1);

    // Build a private two-page chain and put an entry into it before it
    // becomes visible.
    let chain = log.build_chain(2).unwrap();
    let staged = chain.append(16, 7).unwrap();
    staged.write_payload(&[7u8; 16]);
    log.seal(&staged);

    log.append_chain(chain);
    assert_eq!(log.page_count(), 3);

    // The chain leads the walk, the original write head ends it.
    let guard = smr::enter();
    let pages: Vec<_> = log.pages(&guard).collect();
    assert_eq!(pages.len(), 3);
    let first_types: Vec<u32> = pages[0].entries().map(|e| e.entry_type()).collect();
    assert_eq!(first_types, vec![7]);

    // A second splice seals the superseded append head.
    let chain = log.build_chain(1).unwrap();
    log.append_chain(chain);
    assert_eq!(log.page_count(), 4);

    let pages: Vec<_> = log.pages(&guard).collect();
    assert_eq!(pages.len(), 4);
    assert!(
        pages[1].is_sealed(),
        "the previous append head must be sealed by the splice"
    );
}

#[test]
fn full_write_head_adopts_the_append_chain() {
    let pool = PageManager::new(256, 8).unwrap();
    let log = UnorderedLog::new(Arc::clone(&pool)).unwrap();

    let chain = log.build_chain(1).unwrap();
    log.append_chain(chain);
    assert_eq!(log.page_count(), 2);

    // Fill the write head: four 48-byte slots fit a 256-byte page.
    for i in 0..4u32 {
        let entry = log.append(32, i).unwrap();
        log.seal(&entry);
    }
    let available_before = pool.available();

    // The fifth append rolls over; the waiting chain page is adopted
    // instead of allocating a fresh one.
    let entry = log.append(32, 4).unwrap();
    log.seal(&entry);
    assert_eq!(log.page_count(), 2);
    assert_eq!(pool.available(), available_before);

    let guard = smr::enter();
    let head_types: Vec<u32> = log
        .pages(&guard)
        .next()
        .unwrap()
        .entries()
        .map(|e| e.entry_type())
        .collect();
    assert_eq!(head_types, vec![4]);
}

#[test]
fn erase_unlinks_and_reclaims_older_pages() {
    let pool = PageManager::new(256, 8).unwrap();
    let log = UnorderedLog::new(Arc::clone(&pool)).unwrap();

    // Grow the log to three pages by appending twelve 48-byte slots.
    for i in 0..12u32 {
        let entry = log.append(32, i).unwrap();
        log.seal(&entry);
    }
    assert_eq!(log.page_count(), 3);
    let available_before = pool.available();

    // Everything older than the newest page is dropped.
    {
        let guard = smr::enter();
        let newest = log.pages(&guard).next().unwrap();
        log.erase(&newest, None);
    }
    assert_eq!(log.page_count(), 1);

    smr::drain();
    assert_eq!(pool.available(), available_before + 2);

    let guard = smr::enter();
    assert_eq!(log.pages(&guard).count(), 1);
}

#[test]
fn readers_skip_unsealed_entries_by_the_sealed_bit() {
    let pool = PageManager::new(4096, 4).unwrap();
    let log = UnorderedLog::new(pool).unwrap();

    let sealed = log.append(8, 1).unwrap();
    sealed.write_payload(b"finished");
    log.seal(&sealed);

    let _unsealed = log.append(8, 2).unwrap();

    let trailing = log.append(8, 3).unwrap();
    trailing.write_payload(b"as well!");
    log.seal(&trailing);

    let guard = smr::enter();
    let page = log.pages(&guard).next().unwrap();
    let visible: Vec<u32> = page
        .entries()
        .filter(|entry| entry.is_sealed())
        .map(|entry| entry.entry_type())
        .collect();
    assert_eq!(visible, vec![1, 3]);
}
