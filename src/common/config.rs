//! Configuration for Strata trees.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Error, Result};

/// Default split threshold: a page holding this many items is split.
pub const DEFAULT_SPLIT: usize = 5;

/// Default merge threshold: a page holding at most this many items is merged.
pub const DEFAULT_MERGE: usize = 1;

/// Default cache budget, measured in heft.
pub const DEFAULT_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Default period of the background balancer.
pub const DEFAULT_BALANCE_INTERVAL: Duration = Duration::from_millis(100);

/// Orders two keys.
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Derives a key from a record.
pub type Extractor = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Split and merge thresholds for one level of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    /// Item count at which a page is split.
    pub split: usize,
    /// Item count at or below which a page is merged.
    pub merge: usize,
}

impl Order {
    pub fn new(split: usize, merge: usize) -> Self {
        Order { split, merge }
    }

    fn validate(&self, level: &str) -> Result<()> {
        if self.split < 2 {
            return Err(Error::InvalidConfiguration(format!(
                "{level} split must be at least 2, got {}",
                self.split
            )));
        }
        if self.merge + 1 >= self.split {
            return Err(Error::InvalidConfiguration(format!(
                "{level} merge {} must be less than split - 1 ({})",
                self.merge,
                self.split - 1
            )));
        }
        Ok(())
    }
}

impl Default for Order {
    fn default() -> Self {
        Order::new(DEFAULT_SPLIT, DEFAULT_MERGE)
    }
}

/// Checksum applied to every log record and branch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Checksum {
    /// CRC32 via `crc32fast`.
    #[default]
    Crc32,
    /// No verification. Records carry a zero checksum.
    None,
}

impl Checksum {
    /// Compute the checksum of `bytes`.
    pub fn compute(&self, bytes: &[u8]) -> u32 {
        match self {
            Checksum::Crc32 => crc32fast::hash(bytes),
            Checksum::None => 0,
        }
    }

    /// Check `bytes` against an expected checksum.
    pub fn verify(&self, bytes: &[u8], expected: u32) -> bool {
        match self {
            Checksum::Crc32 => crc32fast::hash(bytes) == expected,
            Checksum::None => true,
        }
    }
}

/// Construction-time options of a tree.
///
/// # Example
/// ```
/// use strata::{Options, Order};
///
/// let options = Options {
///     leaf: Order::new(16, 4),
///     ..Options::default()
/// };
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct Options {
    pub leaf: Order,
    pub branch: Order,
    /// Eviction budget, in heft.
    pub cache_size: usize,
    pub comparator: Comparator,
    pub extractor: Extractor,
    pub checksum: Checksum,
    /// Sync appends and commits to disk before returning.
    pub sync: bool,
    /// Period of the background balancer. `None` leaves balancing to
    /// explicit `balance()` / `drain()` calls.
    pub balance_interval: Option<Duration>,
}

impl Options {
    /// Reject thresholds and budgets that cannot produce a valid tree.
    pub fn validate(&self) -> Result<()> {
        self.leaf.validate("leaf")?;
        self.branch.validate("branch")?;
        if self.cache_size == 0 {
            return Err(Error::InvalidConfiguration(
                "cache_size must be greater than zero".into(),
            ));
        }
        if self.balance_interval == Some(Duration::ZERO) {
            return Err(Error::InvalidConfiguration(
                "balance_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        (self.comparator)(left, right)
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            leaf: Order::default(),
            branch: Order::default(),
            cache_size: DEFAULT_CACHE_SIZE,
            comparator: Arc::new(|left: &[u8], right: &[u8]| left.cmp(right)),
            extractor: Arc::new(|record: &[u8]| record.to_vec()),
            checksum: Checksum::default(),
            sync: true,
            balance_interval: Some(DEFAULT_BALANCE_INTERVAL),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("leaf", &self.leaf)
            .field("branch", &self.branch)
            .field("cache_size", &self.cache_size)
            .field("checksum", &self.checksum)
            .field("sync", &self.sync)
            .field("balance_interval", &self.balance_interval)
            .finish_non_exhaustive()
    }
}
