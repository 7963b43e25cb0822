//! Descent - one lock-ordered traversal of the tree.
//!
//! A descent starts above the root, holding nothing. Each step picks a child
//! of the current branch, locks it, and only then lets go of the parent, so
//! every page is reached parent-before-child. Pages passed over can be
//! retained instead of released when an operation needs exclusive holds on
//! a whole path.
//!
//! Branch searches compare against child keys. A child key that was never
//! promoted by a split is derived on demand from the leftmost leaf beneath
//! the child and cached on the branch.

use std::collections::HashMap;

use parking_lot::MappedMutexGuard;

use crate::buffer::{Handle, Locked};
use crate::common::{Error, PageId, Result};
use crate::concurrency::LockMode;
use crate::index::btree::tree::Shared;
use crate::storage::page::{Page, Record};

/// How to choose a child at each level.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Seek<'k> {
    /// Binary search by key.
    Key(&'k [u8]),
    Leftmost,
    Rightmost,
}

/// When to stop descending.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Stop {
    /// A leaf is reached.
    Leaf,
    /// The page at this depth is reached; the root is at depth 0.
    Depth(usize),
    /// The page with this id is reached.
    Address(PageId),
    /// The current branch's chosen child is this page.
    ParentOf(PageId),
    /// The current branch's chosen child is a leaf.
    Penultimate,
    /// The current branch holds the sought key as a child key: the pivot.
    Found,
}

enum Hold<'t> {
    Locked(Locked<'t>),
    /// Shared with the descent this one was forked from, which owns the lock.
    Forked(Handle<'t>),
}

impl<'t> Hold<'t> {
    fn handle(&self) -> &Handle<'t> {
        match self {
            Hold::Locked(locked) => locked.handle(),
            Hold::Forked(handle) => handle,
        }
    }
}

/// Binary search of leaf records starting at `offset`, skipping ghosts.
pub(crate) fn search_records(
    shared: &Shared,
    records: &[Record],
    offset: usize,
    key: &[u8],
) -> std::result::Result<usize, usize> {
    let live = records.get(offset..).unwrap_or_default();
    live.binary_search_by(|record| shared.compare(&record.key, key))
        .map(|index| index + offset)
        .map_err(|index| index + offset)
}

/// The leftmost leaf beneath `id` and its leading key.
pub(crate) fn leftmost_leaf(
    shared: &Shared,
    id: PageId,
    reentrant: bool,
) -> Result<(PageId, Option<Vec<u8>>)> {
    let mut descent = Descent::new(shared, LockMode::Shared);
    descent.reentrant = reentrant;
    descent.start_at(id)?;
    descent.descend(Seek::Leftmost, Stop::Leaf)?;
    let page = descent.page()?;
    Ok((page.id(), page.leading_key().map(<[u8]>::to_vec)))
}

/// The key of the leftmost leaf beneath a child that is not the first.
pub(crate) fn derive_key(shared: &Shared, id: PageId, reentrant: bool) -> Result<Vec<u8>> {
    let (leaf, key) = leftmost_leaf(shared, id, reentrant)?;
    key.ok_or_else(|| Error::corrupt(leaf, "leaf has no leading key"))
}

/// Path state of one traversal.
pub(crate) struct Descent<'t> {
    shared: &'t Shared,
    mode: LockMode,
    reentrant: bool,
    retain: bool,
    current: Option<Hold<'t>>,
    retained: Vec<Locked<'t>>,
    index: usize,
    found: bool,
    depth: usize,
    indexes: HashMap<PageId, usize>,
}

impl<'t> Descent<'t> {
    /// A descent above the root, locking in `mode`.
    pub(crate) fn new(shared: &'t Shared, mode: LockMode) -> Self {
        Descent {
            shared,
            mode,
            reentrant: false,
            retain: false,
            current: None,
            retained: Vec::new(),
            index: 0,
            found: false,
            depth: 0,
            indexes: HashMap::new(),
        }
    }

    /// Lock branches with the balancer's reentrant shared acquisition.
    pub(crate) fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Lock every page from here on exclusively.
    pub(crate) fn exclude(&mut self) {
        self.mode = LockMode::Exclusive;
    }

    /// Keep pages locked as the descent moves past them.
    pub(crate) fn retain(&mut self, retain: bool) {
        self.retain = retain;
    }

    /// A second descent positioned on the current page.
    ///
    /// The fork reads the current page under this descent's lock, so this
    /// descent must stay where it is while the fork uses that page.
    pub(crate) fn fork(&self) -> Result<Descent<'t>> {
        let handle = self.hold()?.handle().clone();
        Ok(Descent {
            shared: self.shared,
            mode: self.mode,
            reentrant: self.reentrant,
            retain: false,
            current: Some(Hold::Forked(handle)),
            retained: Vec::new(),
            index: self.index,
            found: self.found,
            depth: self.depth,
            indexes: self.indexes.clone(),
        })
    }

    // ========================================================================
    // Position
    // ========================================================================

    pub(crate) fn page_id(&self) -> Option<PageId> {
        self.current.as_ref().map(|hold| hold.handle().id())
    }

    /// Index chosen on the current page.
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// True if the last key seek matched exactly.
    pub(crate) fn found(&self) -> bool {
        self.found
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Index chosen on an ancestor.
    pub(crate) fn index_at(&self, id: PageId) -> Option<usize> {
        self.indexes.get(&id).copied()
    }

    /// True if this descent has moved below the page it was forked on.
    pub(crate) fn owns_current(&self) -> bool {
        matches!(self.current, Some(Hold::Locked(_)))
    }

    fn hold(&self) -> Result<&Hold<'t>> {
        self.current
            .as_ref()
            .ok_or_else(|| Error::corrupt(PageId::ROOT, "descent has not started"))
    }

    pub(crate) fn handle(&self) -> Result<&Handle<'t>> {
        Ok(self.hold()?.handle())
    }

    pub(crate) fn page(&self) -> Result<MappedMutexGuard<'_, Page>> {
        self.hold()?.handle().page()
    }

    /// Give up the descent, keeping the lock on the current page.
    pub(crate) fn into_locked(mut self) -> Result<Locked<'t>> {
        match self.current.take() {
            Some(Hold::Locked(locked)) => Ok(locked),
            _ => Err(Error::corrupt(PageId::ROOT, "descent does not own its page")),
        }
    }

    /// Pages retained so far, from the top down.
    pub(crate) fn take_retained(&mut self) -> Vec<Locked<'t>> {
        std::mem::take(&mut self.retained)
    }

    /// Trade the shared hold on the current branch for an exclusive one.
    ///
    /// # Errors
    /// `Error::RaceInvalidated` if the page was deleted in the gap.
    pub(crate) fn upgrade(&mut self) -> Result<()> {
        match self.current.take() {
            Some(Hold::Locked(locked)) => {
                let locked = locked.upgrade();
                let deleted = locked.entry().is_deleted();
                let id = locked.id();
                self.current = Some(Hold::Locked(locked));
                if deleted {
                    return Err(Error::RaceInvalidated(id));
                }
            }
            other => self.current = other,
        }
        Ok(())
    }

    // ========================================================================
    // Movement
    // ========================================================================

    /// Descend until `stop` holds or a leaf is reached.
    ///
    /// # Errors
    /// - `Error::RaceInvalidated` if a page on the way was merged away
    /// - `Error::CorruptPage` / `Error::Io` from page loads
    pub(crate) fn descend(&mut self, seek: Seek<'_>, stop: Stop) -> Result<()> {
        if self.current.is_none() {
            self.start_at(PageId::ROOT)?;
        }
        loop {
            self.seek(seek)?;
            if self.stopped(stop)? {
                return Ok(());
            }
            if self.hold()?.handle().id().is_leaf() {
                return Ok(());
            }
            self.step(self.index)?;
        }
    }

    /// Move to the child at `index` of the current branch.
    pub(crate) fn step(&mut self, index: usize) -> Result<()> {
        let (parent, child) = {
            let page = self.page()?;
            let child = page
                .children()
                .get(index)
                .map(|child| child.id)
                .ok_or(Error::IndexOutOfRange {
                    index,
                    len: page.len(),
                })?;
            (page.id(), child)
        };

        let locked = self.lock(child)?;
        self.indexes.insert(parent, index);
        self.index = 0;
        self.found = false;
        self.depth += 1;
        if let Some(Hold::Locked(previous)) = self.current.replace(Hold::Locked(locked)) {
            if self.retain {
                self.retained.push(previous);
            }
        }
        Ok(())
    }

    /// Begin at `id` instead of the root.
    fn start_at(&mut self, id: PageId) -> Result<()> {
        let locked = self.lock(id)?;
        self.current = Some(Hold::Locked(locked));
        self.depth = 0;
        self.index = 0;
        self.found = false;
        Ok(())
    }

    fn lock(&self, id: PageId) -> Result<Locked<'t>> {
        let handle = self.shared.cache.hold(id)?;
        let locked = if self.reentrant && self.mode == LockMode::Shared && id.is_branch() {
            handle.lock_reentrant()
        } else {
            handle.lock(self.mode)
        };
        if locked.entry().is_deleted() {
            return Err(Error::RaceInvalidated(id));
        }
        Ok(locked)
    }

    fn seek(&mut self, seek: Seek<'_>) -> Result<()> {
        let (index, found) = {
            let page = self.page()?;
            match (seek, page.is_leaf()) {
                (Seek::Leftmost, true) => (page.ghosts(), false),
                (Seek::Leftmost, false) => (0, false),
                (Seek::Rightmost, true) => (page.len(), false),
                (Seek::Rightmost, false) => (page.len().saturating_sub(1), false),
                (Seek::Key(key), true) => {
                    match search_records(self.shared, page.records(), page.ghosts(), key) {
                        Ok(index) => (index, true),
                        Err(index) => (index, false),
                    }
                }
                (Seek::Key(_), false) => (0, false),
            }
        };
        self.index = index;
        self.found = found;
        if let Seek::Key(key) = seek {
            if !self.hold()?.handle().id().is_leaf() {
                let (index, found) = self.search_branch(key)?;
                self.index = index;
                self.found = found;
            }
        }
        Ok(())
    }

    fn stopped(&self, stop: Stop) -> Result<bool> {
        let page = self.page()?;
        let child = page.children().get(self.index).map(|child| child.id);
        Ok(match stop {
            Stop::Leaf => page.is_leaf(),
            Stop::Depth(depth) => self.depth == depth,
            Stop::Address(id) => page.id() == id,
            Stop::ParentOf(id) => child == Some(id),
            Stop::Penultimate => child.is_some_and(|child| child.is_leaf()),
            Stop::Found => !page.is_leaf() && self.found && self.index > 0,
        })
    }

    /// Index of the last child whose key is at most `key`.
    fn search_branch(&self, key: &[u8]) -> Result<(usize, bool)> {
        let len = self.page()?.len();
        let (mut low, mut high) = (1, len);
        while low < high {
            let middle = low + (high - low) / 2;
            let middle_key = self.child_key(middle)?;
            match self.shared.compare(key, &middle_key) {
                std::cmp::Ordering::Less => high = middle,
                std::cmp::Ordering::Equal => return Ok((middle, true)),
                std::cmp::Ordering::Greater => low = middle + 1,
            }
        }
        Ok((low.saturating_sub(1), false))
    }

    /// Key of the child at `index`, deriving and caching it if missing.
    fn child_key(&self, index: usize) -> Result<Vec<u8>> {
        let (id, key) = {
            let page = self.page()?;
            let child = page.children().get(index).ok_or(Error::IndexOutOfRange {
                index,
                len: page.len(),
            })?;
            (child.id, child.key.clone())
        };
        if let Some(key) = key {
            return Ok(key);
        }

        let key = derive_key(self.shared, id, self.reentrant)?;
        let mut page = self.page()?;
        if let Some(child) = page
            .children_mut()
            .and_then(|children| children.get_mut(index))
            .filter(|child| child.id == id)
        {
            child.key = Some(key.clone());
        }
        Ok(key)
    }
}
