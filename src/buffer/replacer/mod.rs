//! Eviction ordering.
//!
//! - [`LruList`] - recency order walked by the page cache when total heft
//!   exceeds its budget

mod lru;

pub use lru::LruList;
