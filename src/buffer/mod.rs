//! Page cache management.
//!
//! The page cache is the in-memory layer between the tree and its page
//! files. It keeps exactly one entry per page and evicts by heft.
//!
//! # Components
//! - [`PageCache`] - The page table, loads and eviction
//! - [`Entry`] - One cached page with its lock queue and counters
//! - [`Handle`] / [`Locked`] / [`BalancerRef`] - RAII pins and locks
//! - [`CacheStats`] - Performance statistics
//! - [`replacer`] - Eviction ordering

mod entry;
mod handle;
mod page_cache;
pub mod replacer;
mod stats;

pub use entry::Entry;
pub use handle::{BalancerRef, Handle, Locked};
pub use page_cache::PageCache;
pub use stats::{CacheStats, StatsSnapshot};
