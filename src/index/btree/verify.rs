//! Structural check of a whole tree.

use std::cmp::Ordering;

use crate::common::{Error, PageId, Result};
use crate::concurrency::LockMode;
use crate::index::btree::tree::Shared;
use crate::storage::page::Page;

/// Shape of a tree as found by [`Tree::verify`](crate::Tree::verify).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Depth of the leaves below the root.
    pub height: usize,
    pub leaves: usize,
    /// Branches, the root included.
    pub branches: usize,
    /// Live records.
    pub records: usize,
}

struct Walk<'t> {
    shared: &'t Shared,
    report: Report,
    /// Leaf depth, fixed by the first leaf reached.
    depth: Option<usize>,
    /// Last key of the previous leaf.
    last: Option<Vec<u8>>,
    /// Right sibling the previous leaf named.
    expected: Option<PageId>,
}

/// Walk every page under shared locks and check the tree's invariants.
///
/// Separator keys that were never derived are not derived here; only keys
/// present on a branch are checked.
///
/// # Errors
/// `Error::CorruptPage` naming the first page found in violation.
pub(crate) fn verify(shared: &Shared) -> Result<Report> {
    let mut walk = Walk {
        shared,
        report: Report::default(),
        depth: None,
        last: None,
        expected: Some(PageId::FIRST_LEAF),
    };
    walk.visit(PageId::ROOT, 0)?;
    if let Some(dangling) = walk.expected {
        return Err(Error::corrupt(dangling, "right sibling is not the next leaf"));
    }
    walk.report.height = walk.depth.unwrap_or(0);
    Ok(walk.report)
}

impl Walk<'_> {
    /// Visit a page and return its least key.
    fn visit(&mut self, id: PageId, depth: usize) -> Result<Option<Vec<u8>>> {
        let locked = self.shared.cache.hold(id)?.lock(LockMode::Shared);
        if locked.entry().is_deleted() {
            return Err(Error::corrupt(id, "deleted page is still referenced"));
        }
        if id.is_leaf() {
            return self.leaf(&*locked.page()?, depth);
        }

        let children = locked.page()?.children().to_vec();
        self.report.branches += 1;
        if children.is_empty() {
            return Err(Error::corrupt(id, "branch has no children"));
        }
        if id != PageId::ROOT && children.len() >= self.shared.options.branch.split {
            return Err(Error::corrupt(id, format!("branch holds {} children", children.len())));
        }

        let mut least = None;
        for (index, child) in children.iter().enumerate() {
            let key = self.visit(child.id, depth + 1)?;
            if index == 0 {
                least = key;
                continue;
            }
            let Some(key) = key else {
                return Err(Error::corrupt(child.id, "child after the first has no keys"));
            };
            if let Some(separator) = &child.key {
                if self.shared.compare(separator, &key) != Ordering::Equal {
                    return Err(Error::corrupt(id, format!("separator {index} is stale")));
                }
            }
        }
        drop(locked);
        Ok(least)
    }

    fn leaf(&mut self, page: &Page, depth: usize) -> Result<Option<Vec<u8>>> {
        let id = page.id();
        match self.depth {
            None => self.depth = Some(depth),
            Some(expected) if expected != depth => {
                return Err(Error::corrupt(id, format!("leaf at depth {depth}, expected {expected}")));
            }
            Some(_) => {}
        }
        if self.expected != Some(id) {
            return Err(Error::corrupt(id, "leaf is not its left sibling's right"));
        }
        self.expected = page.right();

        let sole = id == PageId::FIRST_LEAF && page.right().is_none();
        if !sole && page.live() >= self.shared.options.leaf.split {
            return Err(Error::corrupt(id, format!("leaf holds {} records", page.live())));
        }

        let records = page.records();
        let ghosts = page.ghosts();
        if ghosts > 0 {
            if let (Some(ghost), Some(live)) = (records.first(), records.get(ghosts)) {
                if self.shared.compare(&ghost.key, &live.key) == Ordering::Greater {
                    return Err(Error::corrupt(id, "ghost sorts after the first record"));
                }
            }
        }
        let live = &records[ghosts.min(records.len())..];
        if live
            .windows(2)
            .any(|pair| self.shared.compare(&pair[0].key, &pair[1].key) != Ordering::Less)
        {
            return Err(Error::corrupt(id, "records out of order"));
        }
        if let (Some(last), Some(first)) = (&self.last, records.first()) {
            if self.shared.compare(last, &first.key) != Ordering::Less {
                return Err(Error::corrupt(id, "leaf overlaps its left sibling"));
            }
        }
        if let Some(record) = records.last() {
            self.last = Some(record.key.clone());
        }

        self.report.leaves += 1;
        self.report.records += page.live();
        Ok(records.first().map(|record| record.key.clone()))
    }
}
