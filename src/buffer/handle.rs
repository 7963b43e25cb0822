//! RAII handles on cached pages.
//!
//! - [`Handle`] - pins an entry; unpins when dropped
//! - [`Locked`] - a handle whose page lock is held; unlocks, then unpins
//! - [`BalancerRef`] - keeps an entry's structural summary in the cache for
//!   the duration of a balancing pass

use std::sync::Arc;

use parking_lot::MappedMutexGuard;

use crate::buffer::{Entry, PageCache};
use crate::common::{PageId, Result};
use crate::concurrency::LockMode;
use crate::storage::page::Page;

/// A pin on a cached page.
///
/// While any handle exists the entry stays in the page table and its
/// content stays loaded.
pub struct Handle<'c> {
    cache: &'c PageCache,
    entry: Arc<Entry>,
}

impl<'c> Handle<'c> {
    /// Wrap an entry the caller has already pinned.
    pub(crate) fn new(cache: &'c PageCache, entry: Arc<Entry>) -> Self {
        Self { cache, entry }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.entry.id()
    }

    #[inline]
    pub fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }

    /// Access page content. Callers must hold the page lock.
    #[inline]
    pub fn page(&self) -> Result<MappedMutexGuard<'_, Page>> {
        self.entry.page()
    }

    /// Block until the page lock is held in `mode`.
    pub fn lock(self, mode: LockMode) -> Locked<'c> {
        self.entry.lock().acquire(mode);
        Locked { handle: self, mode }
    }

    /// Shared lock that ignores queued exclusive requests. See
    /// [`PageLock::acquire_shared_reentrant`](crate::concurrency::PageLock::acquire_shared_reentrant).
    pub fn lock_reentrant(self) -> Locked<'c> {
        self.entry.lock().acquire_shared_reentrant();
        Locked {
            handle: self,
            mode: LockMode::Shared,
        }
    }
}

impl Clone for Handle<'_> {
    fn clone(&self) -> Self {
        self.entry.pin();
        Self {
            cache: self.cache,
            entry: Arc::clone(&self.entry),
        }
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        self.cache.release(&self.entry);
    }
}

/// A pinned page whose lock is held.
pub struct Locked<'c> {
    handle: Handle<'c>,
    mode: LockMode,
}

impl<'c> Locked<'c> {
    #[inline]
    pub fn id(&self) -> PageId {
        self.handle.id()
    }

    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    pub fn handle(&self) -> &Handle<'c> {
        &self.handle
    }

    #[inline]
    pub fn entry(&self) -> &Arc<Entry> {
        self.handle.entry()
    }

    #[inline]
    pub fn page(&self) -> Result<MappedMutexGuard<'_, Page>> {
        self.handle.page()
    }

    /// Trade a shared hold for an exclusive one.
    ///
    /// The lock is released before the exclusive request is queued, so this
    /// is only sound for pages whose structure nobody else can change in the
    /// gap: branches, which only the balancer rewrites.
    pub fn upgrade(self) -> Locked<'c> {
        if self.mode == LockMode::Exclusive {
            return self;
        }
        let handle = self.handle.clone();
        drop(self);
        handle.lock(LockMode::Exclusive)
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        self.handle.entry.lock().release(self.mode);
    }
}

/// A balancer's reference to a page.
///
/// Does not pin: the content may be evicted, but the entry stays in the page
/// table with its [`Summary`](crate::storage::page::Summary).
pub struct BalancerRef<'c> {
    cache: &'c PageCache,
    entry: Arc<Entry>,
}

impl<'c> BalancerRef<'c> {
    pub(crate) fn new(cache: &'c PageCache, entry: Arc<Entry>) -> Self {
        entry.add_balancer();
        Self { cache, entry }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.entry.id()
    }

    #[inline]
    pub fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }
}

impl Drop for BalancerRef<'_> {
    fn drop(&mut self) {
        self.cache.release_balancer(&self.entry);
    }
}
