//! Page cache statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics tracked by a tree's page cache and writers.
///
/// All fields are atomic for lock-free, thread-safe updates. Counters use
/// `Ordering::Relaxed`: only atomicity matters, not ordering between them.
///
/// # Example
/// ```
/// use strata::CacheStats;
/// use std::sync::atomic::Ordering;
///
/// let stats = CacheStats::new();
/// stats.cache_hits.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(stats.cache_hits.load(Ordering::Relaxed), 1);
/// ```
#[derive(Debug)]
pub struct CacheStats {
    /// Number of times a page was found in the cache.
    pub cache_hits: AtomicU64,

    /// Number of times a page had no cache entry.
    pub cache_misses: AtomicU64,

    /// Number of times a page's content was evicted.
    pub evictions: AtomicU64,

    /// Number of pages loaded from disk.
    pub pages_read: AtomicU64,

    /// Number of journaled commits.
    pub commits: AtomicU64,

    /// Bytes appended to leaf segments.
    pub bytes_appended: AtomicU64,
}

impl CacheStats {
    /// Create a new stats tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pages_read: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            bytes_appended: AtomicU64::new(0),
        }
    }

    /// Calculate cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        self.snapshot().hit_rate()
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.pages_read.store(0, Ordering::Relaxed);
        self.commits.store(0, Ordering::Relaxed);
        self.bytes_appended.store(0, Ordering::Relaxed);
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub pages_read: u64,
    pub commits: u64,
    pub bytes_appended: u64,
}

impl StatsSnapshot {
    /// Calculate cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ hits: {}, misses: {}, evictions: {}, reads: {}, commits: {}, hit_rate: {:.2}% }}",
            self.cache_hits,
            self.cache_misses,
            self.evictions,
            self.pages_read,
            self.commits,
            self.hit_rate() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats.cache_hits.load(Ordering::Relaxed), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = CacheStats::new();
        stats.cache_hits.fetch_add(7, Ordering::Relaxed);
        stats.cache_misses.fetch_add(3, Ordering::Relaxed);
        stats.commits.fetch_add(2, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cache_hits, 7);
        assert_eq!(snapshot.commits, 2);
        assert_eq!(snapshot.hit_rate(), 0.7);
    }

    #[test]
    fn test_stats_reset() {
        let stats = CacheStats::new();
        stats.cache_hits.fetch_add(100, Ordering::Relaxed);
        stats.bytes_appended.fetch_add(64, Ordering::Relaxed);

        stats.reset();

        assert_eq!(stats.snapshot().bytes_appended, 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_stats_display() {
        let stats = CacheStats::new();
        stats.cache_hits.fetch_add(80, Ordering::Relaxed);
        stats.cache_misses.fetch_add(20, Ordering::Relaxed);

        let display = format!("{}", stats.snapshot());
        assert!(display.contains("hits: 80"));
        assert!(display.contains("80.00%"));
    }
}
