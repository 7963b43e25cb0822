//! Recency list for heft-based eviction.

use std::collections::{BTreeMap, HashMap};

use crate::common::PageId;

/// Orders cached pages from least to most recently used.
///
/// Every access stamps the page with a fresh tick; eviction walks the ticks
/// in ascending order.
#[derive(Debug, Default)]
pub struct LruList {
    stamps: HashMap<PageId, u64>,
    order: BTreeMap<u64, PageId>,
    clock: u64,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `page_id` to the most recently used end.
    pub fn record_access(&mut self, page_id: PageId) {
        if let Some(stamp) = self.stamps.remove(&page_id) {
            self.order.remove(&stamp);
        }
        self.clock += 1;
        self.stamps.insert(page_id, self.clock);
        self.order.insert(self.clock, page_id);
    }

    /// Forget `page_id`.
    pub fn remove(&mut self, page_id: PageId) {
        if let Some(stamp) = self.stamps.remove(&page_id) {
            self.order.remove(&stamp);
        }
    }

    /// Pages from least to most recently used.
    pub fn victims(&self) -> Vec<PageId> {
        self.order.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}
