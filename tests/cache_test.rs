//! Integration tests for the page cache under a working tree.

use std::sync::atomic::Ordering;

use strata::buffer::PageCache;
use strata::storage::PageStore;
use strata::{Checksum, Order, PageId, Tree};
use tempfile::tempdir;

#[test]
fn test_purge_then_reload_from_disk() {
    let dir = tempdir().unwrap();
    let tree = Tree::builder()
        .directory(dir.path().join("tree"))
        .leaf(Order::new(6, 1))
        .branch(Order::new(6, 1))
        .sync(false)
        .balance_interval(None)
        .create()
        .unwrap();
    for i in 0..100 {
        let key = format!("{i:03}");
        tree.insert(key.as_bytes(), &[b'x'; 64]).unwrap();
    }
    tree.drain().unwrap();

    tree.purge(0);
    let after_purge = tree.stats();
    assert!(after_purge.evictions > 0);

    let count = tree.iter().map(|record| record.unwrap()).count();
    assert_eq!(count, 100);
    let after_scan = tree.stats();
    assert!(after_scan.cache_misses > after_purge.cache_misses);
    assert!(after_scan.pages_read > after_purge.pages_read);
    assert!(after_scan.commits > 0);
    assert!(after_scan.bytes_appended > 0);
}

#[test]
fn test_small_budget_keeps_tree_usable() {
    let dir = tempdir().unwrap();
    let tree = Tree::builder()
        .directory(dir.path().join("tree"))
        .leaf(Order::new(5, 1))
        .branch(Order::new(5, 1))
        .cache_size(256)
        .sync(false)
        .balance_interval(None)
        .create()
        .unwrap();
    for i in 0..60 {
        let key = format!("{i:03}");
        tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
        if i % 10 == 9 {
            tree.drain().unwrap();
        }
    }
    tree.drain().unwrap();
    assert_eq!(tree.iter().count(), 60);
    assert!(tree.stats().evictions > 0);
    tree.verify().unwrap();
}

#[test]
fn test_cache_over_store() {
    let dir = tempdir().unwrap();
    let store = PageStore::create(dir.path().join("tree"), Checksum::Crc32, false).unwrap();
    let cache = PageCache::new(store, 1 << 20);

    let root = cache.hold(PageId::ROOT).unwrap();
    assert_eq!(root.page().unwrap().children().len(), 1);
    let again = cache.hold(PageId::ROOT).unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().cache_misses.load(Ordering::Relaxed), 1);
    assert_eq!(cache.stats().cache_hits.load(Ordering::Relaxed), 1);
    drop(root);
    drop(again);

    cache.purge(0);
    assert!(cache.is_empty());
    assert_eq!(cache.heft(), 0);
}
