//! Page - the in-memory form of a tree node.
//!
//! A [`Page`] is either a leaf holding [`Record`]s or a branch holding
//! [`Child`] references, distinguished by [`Items`]. Leaves also carry their
//! right-sibling link and their ghost count.

use crate::common::PageId;

/// A key and its record bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Record {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serialized size of the record's parts.
    #[inline]
    pub fn heft(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// A branch's reference to a child page.
///
/// `key` is the least key reachable under the child. The first child of a
/// branch never has one. A later child may lack one too, in which case it is
/// derived on demand from the leftmost leaf beneath the child and cached here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub id: PageId,
    pub key: Option<Vec<u8>>,
}

impl Child {
    pub fn new(id: PageId, key: Option<Vec<u8>>) -> Self {
        Child { id, key }
    }
}

/// Items of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Items {
    Leaf(Vec<Record>),
    Branch(Vec<Child>),
}

impl Items {
    pub fn len(&self) -> usize {
        match self {
            Items::Leaf(records) => records.len(),
            Items::Branch(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split off the items from `at` onward, keeping the kind.
    pub fn split_off(&mut self, at: usize) -> Items {
        match self {
            Items::Leaf(records) => Items::Leaf(records.split_off(at)),
            Items::Branch(children) => Items::Branch(children.split_off(at)),
        }
    }

    fn heft(&self) -> usize {
        match self {
            Items::Leaf(records) => records.iter().map(Record::heft).sum(),
            Items::Branch(children) => children
                .iter()
                .map(|child| 8 + child.key.as_ref().map_or(0, Vec::len))
                .sum(),
        }
    }
}

/// Structural metadata of a page, kept for the balancer even when the page's
/// content has been evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub items: usize,
    pub ghosts: usize,
    pub right: Option<PageId>,
    pub key: Option<Vec<u8>>,
}

impl Summary {
    /// Items that are not ghosts.
    pub fn live(&self) -> usize {
        self.items - self.ghosts
    }
}

/// A tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub(crate) id: PageId,
    pub(crate) items: Items,
    /// Leading records kept only for their key. Zero or one, leaves only.
    pub(crate) ghosts: usize,
    /// Right sibling, leaves only.
    pub(crate) right: Option<PageId>,
    /// Current segment of a leaf, or current content file of a branch.
    pub(crate) file: Option<String>,
}

impl Page {
    /// An empty leaf.
    pub fn leaf(id: PageId) -> Self {
        Page {
            id,
            items: Items::Leaf(Vec::new()),
            ghosts: 0,
            right: None,
            file: None,
        }
    }

    /// A branch over `children`.
    pub fn branch(id: PageId, children: Vec<Child>) -> Self {
        Page {
            id,
            items: Items::Branch(children),
            ghosts: 0,
            right: None,
            file: None,
        }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.items, Items::Leaf(_))
    }

    /// Item count, ghosts included.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item count, ghosts excluded.
    #[inline]
    pub fn live(&self) -> usize {
        self.items.len() - self.ghosts
    }

    #[inline]
    pub fn ghosts(&self) -> usize {
        self.ghosts
    }

    #[inline]
    pub fn right(&self) -> Option<PageId> {
        self.right
    }

    /// Records of a leaf; empty for a branch.
    pub fn records(&self) -> &[Record] {
        match &self.items {
            Items::Leaf(records) => records,
            Items::Branch(_) => &[],
        }
    }

    /// Children of a branch; empty for a leaf.
    pub fn children(&self) -> &[Child] {
        match &self.items {
            Items::Branch(children) => children,
            Items::Leaf(_) => &[],
        }
    }

    pub(crate) fn records_mut(&mut self) -> Option<&mut Vec<Record>> {
        match &mut self.items {
            Items::Leaf(records) => Some(records),
            Items::Branch(_) => None,
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<Child>> {
        match &mut self.items {
            Items::Branch(children) => Some(children),
            Items::Leaf(_) => None,
        }
    }

    /// The key a branch uses to route to this leaf: its first record, ghost
    /// included. The leftmost leaf of the tree has none.
    pub fn leading_key(&self) -> Option<&[u8]> {
        if self.id == PageId::FIRST_LEAF {
            return None;
        }
        self.records().first().map(|record| record.key.as_slice())
    }

    /// Remove the record at `index`.
    ///
    /// Removing the leading record of any leaf but the leftmost turns it into
    /// a ghost instead, since the record's key is the page's routing key.
    /// Returns true if a ghost was made. Replay of a `delete` record goes
    /// through here as well.
    pub(crate) fn delete(&mut self, index: usize) -> bool {
        if self.makes_ghost(index) {
            self.ghosts = 1;
            return true;
        }
        if let Items::Leaf(records) = &mut self.items {
            if index < records.len() {
                records.remove(index);
                if index < self.ghosts {
                    self.ghosts -= 1;
                }
            }
        }
        false
    }

    /// True if deleting the record at `index` would ghost it.
    pub(crate) fn makes_ghost(&self, index: usize) -> bool {
        index == 0 && self.id != PageId::FIRST_LEAF && self.ghosts == 0
    }

    /// Overwrite the record at `index` in place. The record keeps its slot,
    /// so a leading record stays the page's routing key.
    pub(crate) fn replace(&mut self, index: usize, record: Record) -> Option<Record> {
        let slot = self.records_mut()?.get_mut(index)?;
        Some(std::mem::replace(slot, record))
    }

    /// Approximate serialized size, used for cache accounting.
    pub fn heft(&self) -> usize {
        16 + self.items.heft()
    }

    pub fn summary(&self) -> Summary {
        Summary {
            items: self.len(),
            ghosts: self.ghosts,
            right: self.right,
            key: self.leading_key().map(<[u8]>::to_vec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(id: u64, keys: &[&str]) -> Page {
        let mut page = Page::leaf(PageId::new(id));
        let records = page.records_mut().unwrap();
        for key in keys {
            records.push(Record::new(key.as_bytes(), key.as_bytes()));
        }
        page
    }

    #[test]
    fn test_leading_key() {
        assert_eq!(leaf_with(1, &["a", "b"]).leading_key(), None);
        assert_eq!(leaf_with(3, &["c", "d"]).leading_key(), Some(&b"c"[..]));
        assert_eq!(leaf_with(3, &[]).leading_key(), None);
    }

    #[test]
    fn test_delete_leading_record_makes_ghost() {
        let mut page = leaf_with(3, &["c", "d"]);
        assert!(page.delete(0));
        assert_eq!(page.ghosts(), 1);
        assert_eq!(page.len(), 2);
        assert_eq!(page.live(), 1);
        assert_eq!(page.leading_key(), Some(&b"c"[..]));

        assert!(!page.delete(1));
        assert_eq!(page.len(), 1);
        assert_eq!(page.live(), 0);
    }

    #[test]
    fn test_delete_ghost_slot_clears_count() {
        let mut page = leaf_with(3, &["c", "d"]);
        assert!(page.delete(0));
        assert!(!page.delete(0));
        assert_eq!(page.ghosts(), 0);
        assert_eq!(page.len(), 1);
        assert_eq!(page.live(), 1);
        assert_eq!(page.leading_key(), Some(&b"d"[..]));
    }

    #[test]
    fn test_replace_keeps_slot() {
        let mut page = leaf_with(3, &["c", "d"]);
        let old = page.replace(0, Record::new(b"c".to_vec(), b"new".to_vec())).unwrap();
        assert_eq!(old.value, b"c");
        assert_eq!(page.ghosts(), 0);
        assert_eq!(page.records()[0].value, b"new");
        assert!(page.replace(2, Record::new(b"x".to_vec(), b"x".to_vec())).is_none());
    }

    #[test]
    fn test_leftmost_leaf_never_ghosts() {
        let mut page = leaf_with(1, &["a", "b"]);
        assert!(!page.delete(0));
        assert_eq!(page.ghosts(), 0);
        assert_eq!(page.records()[0].key, b"b");
    }

    #[test]
    fn test_split_off_keeps_kind() {
        let mut items = Items::Branch(vec![
            Child::new(PageId::new(1), None),
            Child::new(PageId::new(3), Some(b"m".to_vec())),
        ]);
        let right = items.split_off(1);
        assert_eq!(items.len(), 1);
        assert!(matches!(right, Items::Branch(ref children) if children[0].id == PageId::new(3)));
    }

    #[test]
    fn test_summary_and_heft() {
        let page = leaf_with(5, &["ab", "cd"]);
        let summary = page.summary();
        assert_eq!(summary.items, 2);
        assert_eq!(summary.live(), 2);
        assert_eq!(summary.key.as_deref(), Some(&b"ab"[..]));
        assert_eq!(page.heft(), 16 + 8);
    }
}
