//! Page Cache - the in-memory page table.
//!
//! The [`PageCache`] provides:
//! - One [`Entry`] per page id, created on first reference
//! - Pin-based reference counting through [`Handle`]
//! - Coalesced loads: concurrent misses on one page share a single read
//! - Heft-bounded eviction in least-recently-used order

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::buffer::entry::Slot;
use crate::buffer::replacer::LruList;
use crate::buffer::{BalancerRef, CacheStats, Entry, Handle};
use crate::common::{Error, PageId, Result};
use crate::storage::page::Page;
use crate::storage::PageStore;

struct CacheInner {
    entries: HashMap<PageId, Arc<Entry>>,
    lru: LruList,
}

/// What a caller of [`PageCache::load`] does next.
enum Next {
    Ready,
    Wait,
    Fail(String),
    Load,
}

/// Caches the pages of one tree.
///
/// # Architecture
/// ```text
/// ┌──────────────────────────────────────────────────────────┐
/// │                        PageCache                         │
/// │  ┌────────────────────┐   ┌──────────────────────────┐   │
/// │  │ entries            │   │ Entry                    │   │
/// │  │ PageId → Arc<Entry>│──▶│ slot │ lock │ pins │ heft│   │
/// │  └────────────────────┘   └──────────────────────────┘   │
/// │  ┌──────────┐  ┌──────────┐  ┌──────────────┐            │
/// │  │   lru    │  │  store   │  │ heft / limit │            │
/// │  └──────────┘  └──────────┘  └──────────────┘            │
/// └──────────────────────────────────────────────────────────┘
/// ```
///
/// # Thread Safety
/// - `inner`: `Mutex`; pins are taken under it, so eviction never races a
///   new pin
/// - entry content: each entry's own mutex
/// - `heft`, `stats`: atomics
pub struct PageCache {
    store: PageStore,
    inner: Mutex<CacheInner>,
    heft: AtomicUsize,
    limit: usize,
    stats: CacheStats,
}

impl PageCache {
    /// Create a cache over `store` with an eviction budget of `limit` heft.
    pub fn new(store: PageStore, limit: usize) -> Self {
        Self {
            store,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru: LruList::new(),
            }),
            heft: AtomicUsize::new(0),
            limit,
            stats: CacheStats::new(),
        }
    }

    // ========================================================================
    // Public API: Hold pages
    // ========================================================================

    /// Pin a page, loading it on a miss.
    ///
    /// # Errors
    /// - `Error::CorruptPage` if the page fails to load, including when this
    ///   caller waited on another caller's failed load
    /// - `Error::Io` if the page's files cannot be read
    pub fn hold(&self, id: PageId) -> Result<Handle<'_>> {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = match inner.entries.get(&id) {
                Some(entry) => {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    Arc::clone(entry)
                }
                None => {
                    self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                    let entry = Arc::new(Entry::new(id));
                    inner.entries.insert(id, Arc::clone(&entry));
                    entry
                }
            };
            entry.pin();
            inner.lru.record_access(id);
            entry
        };

        let handle = Handle::new(self, entry);
        self.load(handle.entry())?;
        Ok(handle)
    }

    /// Add a freshly created page and pin it.
    pub fn create(&self, page: Page) -> Handle<'_> {
        let id = page.id();
        let entry = Arc::new(Entry::with_page(page));
        entry.pin();
        {
            let mut inner = self.inner.lock();
            inner.entries.insert(id, Arc::clone(&entry));
            inner.lru.record_access(id);
        }
        self.account(&entry);
        Handle::new(self, entry)
    }

    /// Keep a page's summary cached for the balancer.
    pub fn reference(&self, handle: &Handle<'_>) -> BalancerRef<'_> {
        BalancerRef::new(self, Arc::clone(handle.entry()))
    }

    // ========================================================================
    // Public API: Eviction
    // ========================================================================

    /// Evict idle entries, least recently used first, until total heft is at
    /// most `down_to`.
    ///
    /// Locked or pinned entries are skipped. An entry the balancer references
    /// keeps its place in the table with a summary of its content.
    pub fn purge(&self, down_to: usize) {
        let mut inner = self.inner.lock();
        for id in inner.lru.victims() {
            if self.heft() <= down_to {
                break;
            }
            let Some(entry) = inner.entries.get(&id).cloned() else {
                inner.lru.remove(id);
                continue;
            };
            if !entry.is_idle() {
                continue;
            }

            let keep = entry.balancer_count() > 0;
            {
                let mut slot = entry.slot();
                let summary = match &*slot {
                    Slot::Loaded(page) if keep => Some(page.summary()),
                    _ => None,
                };
                if let Some(summary) = summary {
                    *slot = Slot::Evicted(summary);
                }
            }
            if !keep {
                inner.entries.remove(&id);
            }
            inner.lru.remove(id);
            self.discharge(&entry);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(target: "strata::cache", page = id.0, kept = keep, "evicted");
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Total heft of loaded entries.
    pub fn heft(&self) -> usize {
        self.heft.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of entries in the page table.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry for `id`, if one is in the table. Does not pin.
    pub fn peek(&self, id: PageId) -> Option<Arc<Entry>> {
        self.inner.lock().entries.get(&id).cloned()
    }

    // ========================================================================
    // Internal: Release (called by handles)
    // ========================================================================

    pub(crate) fn release(&self, entry: &Arc<Entry>) {
        self.account(entry);
        if entry.unpin() > 0 {
            return;
        }
        if entry.is_deleted() {
            self.forget(entry);
        } else if self.heft() > self.limit {
            self.purge(self.limit);
        }
    }

    pub(crate) fn release_balancer(&self, entry: &Arc<Entry>) {
        if entry.remove_balancer() > 0 || entry.is_pinned() {
            return;
        }
        if entry.is_deleted() || !entry.is_loaded() {
            self.forget(entry);
        }
    }

    // ========================================================================
    // Internal: Loading and accounting
    // ========================================================================

    fn load(&self, entry: &Entry) -> Result<()> {
        {
            let mut slot = entry.slot();
            let mut waited = false;
            loop {
                let next = match &*slot {
                    Slot::Loaded(_) => Next::Ready,
                    Slot::Loading => Next::Wait,
                    Slot::Failed(reason) if waited => Next::Fail(reason.clone()),
                    Slot::Absent | Slot::Evicted(_) | Slot::Failed(_) => Next::Load,
                };
                match next {
                    Next::Ready => return Ok(()),
                    Next::Wait => {
                        waited = true;
                        entry.wait_loaded(&mut slot);
                    }
                    Next::Fail(reason) => return Err(Error::corrupt(entry.id(), reason)),
                    Next::Load => {
                        *slot = Slot::Loading;
                        break;
                    }
                }
            }
        }

        trace!(target: "strata::cache", page = entry.id().0, "loading");
        let result = self.store.read(entry.id());
        let outcome = {
            let mut slot = entry.slot();
            match result {
                Ok(page) => {
                    *slot = Slot::Loaded(page);
                    self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(err) => {
                    *slot = Slot::Failed(err.to_string());
                    Err(err)
                }
            }
        };
        entry.notify_loaded();
        if outcome.is_ok() {
            self.account(entry);
        }
        outcome
    }

    /// Re-measure an entry's heft and adjust the total.
    fn account(&self, entry: &Entry) {
        let heft = match &*entry.slot() {
            Slot::Loaded(page) => page.heft(),
            _ => 0,
        };
        let old = entry.charge(heft);
        if heft >= old {
            self.heft.fetch_add(heft - old, Ordering::AcqRel);
        } else {
            self.heft.fetch_sub(old - heft, Ordering::AcqRel);
        }
    }

    fn discharge(&self, entry: &Entry) {
        let old = entry.charge(0);
        self.heft.fetch_sub(old, Ordering::AcqRel);
    }

    /// Drop an unreferenced entry from the table.
    fn forget(&self, entry: &Arc<Entry>) {
        let mut inner = self.inner.lock();
        if entry.is_pinned() || entry.balancer_count() > 0 {
            return;
        }
        let id = entry.id();
        let current = inner
            .entries
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if current {
            inner.entries.remove(&id);
            inner.lru.remove(id);
            self.discharge(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::thread;

    use crate::common::Checksum;
    use crate::storage::page::{Header, Record};

    fn create_test_cache(limit: usize) -> (PageCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::create(dir.path().join("tree"), Checksum::Crc32, false).unwrap();
        (PageCache::new(store, limit), dir)
    }

    fn fill_leaf(cache: &PageCache, count: usize) {
        for index in 0..count {
            let key = format!("{index:04}");
            let frame = cache
                .store()
                .frame(&Header::Insert { index }, &[key.as_bytes(), &[0u8; 100]])
                .unwrap();
            cache.store().append(PageId::FIRST_LEAF, "0.0", &frame).unwrap();
        }
    }

    #[test]
    fn test_hold_loads_once() {
        let (cache, _dir) = create_test_cache(1 << 20);
        {
            let root = cache.hold(PageId::ROOT).unwrap();
            assert_eq!(root.page().unwrap().children().len(), 1);
            assert_eq!(root.entry().pin_count(), 1);
        }
        let _again = cache.hold(PageId::ROOT).unwrap();

        let stats = cache.stats().snapshot();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.pages_read, 1);
    }

    #[test]
    fn test_one_entry_per_page() {
        let (cache, _dir) = create_test_cache(1 << 20);
        let first = cache.hold(PageId::ROOT).unwrap();
        let second = cache.hold(PageId::ROOT).unwrap();
        assert!(Arc::ptr_eq(first.entry(), second.entry()));
        assert_eq!(first.entry().pin_count(), 2);
        drop(first);
        assert_eq!(second.entry().pin_count(), 1);
    }

    #[test]
    fn test_concurrent_misses_coalesce() {
        let (cache, _dir) = create_test_cache(1 << 20);
        fill_leaf(&cache, 50);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let leaf = cache.hold(PageId::FIRST_LEAF).unwrap();
                    assert_eq!(leaf.page().unwrap().len(), 50);
                });
            }
        });

        assert_eq!(cache.stats().snapshot().pages_read, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_purge_skips_pinned() {
        let (cache, _dir) = create_test_cache(1 << 20);
        fill_leaf(&cache, 10);
        let root = cache.hold(PageId::ROOT).unwrap();
        drop(cache.hold(PageId::FIRST_LEAF).unwrap());
        assert!(cache.heft() > 0);

        cache.purge(0);
        assert!(cache.peek(PageId::FIRST_LEAF).is_none());
        assert!(cache.peek(PageId::ROOT).is_some());
        assert_eq!(cache.heft(), root.entry().heft());
        assert_eq!(cache.stats().snapshot().evictions, 1);
    }

    #[test]
    fn test_release_over_budget_evicts() {
        let (cache, _dir) = create_test_cache(64);
        fill_leaf(&cache, 20);
        drop(cache.hold(PageId::FIRST_LEAF).unwrap());
        assert!(cache.peek(PageId::FIRST_LEAF).is_none());
        assert!(cache.heft() <= 64);
    }

    #[test]
    fn test_balancer_reference_keeps_summary() {
        let (cache, _dir) = create_test_cache(1 << 20);
        fill_leaf(&cache, 3);
        let reference = {
            let leaf = cache.hold(PageId::FIRST_LEAF).unwrap();
            cache.reference(&leaf)
        };

        cache.purge(0);
        let entry = cache.peek(PageId::FIRST_LEAF).unwrap();
        assert!(Arc::ptr_eq(&entry, reference.entry()));
        assert!(!entry.is_loaded());
        assert_eq!(entry.summary().unwrap().items, 3);

        // Holding again reloads into the same entry.
        let leaf = cache.hold(PageId::FIRST_LEAF).unwrap();
        assert!(Arc::ptr_eq(leaf.entry(), &entry));
        assert_eq!(leaf.page().unwrap().len(), 3);
        drop(leaf);
        drop(reference);
    }

    #[test]
    fn test_failed_load_surfaces_and_is_not_cached() {
        let (cache, dir) = create_test_cache(1 << 20);
        let mut bytes = cache
            .store()
            .frame(&Header::Insert { index: 0 }, &[b"a", b"a"])
            .unwrap();
        bytes[9] ^= 0xFF;
        bytes.extend(
            cache
                .store()
                .frame(&Header::Insert { index: 1 }, &[b"b", b"b"])
                .unwrap(),
        );
        fs::write(dir.path().join("tree/pages/1/0.0"), bytes).unwrap();

        assert!(matches!(
            cache.hold(PageId::FIRST_LEAF),
            Err(Error::CorruptPage { .. })
        ));
        let entry = cache.peek(PageId::FIRST_LEAF).unwrap();
        assert!(!entry.is_pinned());
        assert!(entry.summary().is_none());
    }

    #[test]
    fn test_create_and_forget_deleted() {
        let (cache, _dir) = create_test_cache(1 << 20);
        let mut page = Page::leaf(PageId::new(3));
        page.records_mut().unwrap().push(Record::new("k", "v"));
        let handle = cache.create(page);
        assert!(cache.heft() > 0);

        handle.entry().mark_deleted();
        drop(handle);
        assert!(cache.peek(PageId::new(3)).is_none());
        assert_eq!(cache.heft(), 0);
    }
}
