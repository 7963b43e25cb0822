//! Page identifier type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a page of the tree, both in the cache and on disk.
///
/// Branch and leaf ids are drawn from disjoint ranges: branches are even,
/// leaves are odd. The root is always [`PageId::ROOT`] and the leftmost leaf
/// of the tree is always [`PageId::FIRST_LEAF`]; neither is ever reused for
/// another page.
///
/// # Example
/// ```
/// use strata::PageId;
///
/// assert!(PageId::ROOT.is_branch());
/// assert!(PageId::FIRST_LEAF.is_leaf());
/// assert_eq!(PageId::new(7).to_string(), "7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl PageId {
    /// The root branch. Always present, never moved.
    pub const ROOT: PageId = PageId(0);

    /// The leftmost leaf of the tree. Merges go left, so it is never removed.
    pub const FIRST_LEAF: PageId = PageId(1);

    /// Create a new PageId.
    #[inline]
    pub fn new(id: u64) -> Self {
        PageId(id)
    }

    /// Leaves have odd ids.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Branches have even ids.
    #[inline]
    pub fn is_branch(&self) -> bool {
        !self.is_leaf()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
