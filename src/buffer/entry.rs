//! Entry - one cached page.
//!
//! An [`Entry`] holds a page's content plus the metadata the cache and the
//! descent protocol need:
//! - The page lock queue
//! - Pin count for reference counting
//! - Balancer reference count
//! - Heft charged to the cache
//! - Deleted flag for pages merged away while still referenced

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};

use crate::common::{Error, PageId, Result};
use crate::concurrency::PageLock;
use crate::storage::page::{Page, Summary};

/// Load state of an entry's content.
#[derive(Debug)]
pub(crate) enum Slot {
    /// Never loaded, or evicted without a balancer reference.
    Absent,
    /// A load is in flight; others wait on the entry's condvar.
    Loading,
    Loaded(Page),
    /// Content evicted while the balancer referenced the page.
    Evicted(Summary),
    /// The last load failed with this message.
    Failed(String),
}

/// A page in the cache.
///
/// Exactly one `Entry` exists per page id at a time; the cache's page table
/// enforces it. That uniqueness is what makes the embedded [`PageLock`]
/// meaningful.
///
/// # Thread Safety
/// - `slot`: `Mutex`, held only briefly and only by lock holders
/// - `lock`: the page lock queue
/// - counters: atomics
pub struct Entry {
    id: PageId,
    slot: Mutex<Slot>,
    loaded: Condvar,
    lock: PageLock,
    pin_count: AtomicU32,
    balancers: AtomicU32,
    heft: AtomicUsize,
    deleted: AtomicBool,
}

impl Entry {
    /// An entry whose content is not loaded yet.
    pub(crate) fn new(id: PageId) -> Self {
        Self::with_slot(id, Slot::Absent)
    }

    /// An entry for a freshly created page.
    pub(crate) fn with_page(page: Page) -> Self {
        Self::with_slot(page.id(), Slot::Loaded(page))
    }

    fn with_slot(id: PageId, slot: Slot) -> Self {
        Self {
            id,
            slot: Mutex::new(slot),
            loaded: Condvar::new(),
            lock: PageLock::new(),
            pin_count: AtomicU32::new(0),
            balancers: AtomicU32::new(0),
            heft: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[inline]
    pub fn lock(&self) -> &PageLock {
        &self.lock
    }

    // ========================================================================
    // Content (Mutex)
    // ========================================================================

    /// Access the loaded page.
    ///
    /// Only valid while the entry is pinned, which keeps it loaded.
    pub fn page(&self) -> Result<MappedMutexGuard<'_, Page>> {
        MutexGuard::try_map(self.slot.lock(), |slot| match slot {
            Slot::Loaded(page) => Some(page),
            _ => None,
        })
        .map_err(|_| Error::corrupt(self.id, "page content is not loaded"))
    }

    /// Replace the page content.
    pub(crate) fn install(&self, page: Page) {
        *self.slot.lock() = Slot::Loaded(page);
    }

    /// Structural metadata, available while loaded or evicted under a
    /// balancer reference.
    pub fn summary(&self) -> Option<Summary> {
        match &*self.slot.lock() {
            Slot::Loaded(page) => Some(page.summary()),
            Slot::Evicted(summary) => Some(summary.clone()),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Loaded(_))
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock()
    }

    pub(crate) fn wait_loaded(&self, slot: &mut MutexGuard<'_, Slot>) {
        self.loaded.wait(slot);
    }

    pub(crate) fn notify_loaded(&self) {
        self.loaded.notify_all();
    }

    // ========================================================================
    // Pin count operations (Atomic)
    // ========================================================================

    /// Increment the pin count. Returns the new pin count.
    #[inline]
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the pin count. Returns the new pin count.
    ///
    /// # Panics
    /// Panics if pin count is already 0.
    #[inline]
    pub(crate) fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "pin count underflow");
        old - 1
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    // ========================================================================
    // Balancer references (Atomic)
    // ========================================================================

    #[inline]
    pub(crate) fn add_balancer(&self) {
        self.balancers.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the new balancer count.
    #[inline]
    pub(crate) fn remove_balancer(&self) -> u32 {
        let old = self.balancers.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "balancer reference underflow");
        old - 1
    }

    #[inline]
    pub fn balancer_count(&self) -> u32 {
        self.balancers.load(Ordering::Acquire)
    }

    // ========================================================================
    // Heft and deletion
    // ========================================================================

    /// Record the heft now charged for this entry, returning the previous
    /// charge.
    #[inline]
    pub(crate) fn charge(&self, heft: usize) -> usize {
        self.heft.swap(heft, Ordering::AcqRel)
    }

    #[inline]
    pub fn heft(&self) -> usize {
        self.heft.load(Ordering::Acquire)
    }

    /// Mark the page as removed from the tree.
    #[inline]
    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Evictable: nobody pins or locks the page.
    pub(crate) fn is_idle(&self) -> bool {
        !self.is_pinned() && !self.lock.is_locked()
    }
}
