//! Cursors - client access to one leaf at a time.
//!
//! A [`Cursor`] holds a lock on one leaf, found by a key-seeking descent,
//! and moves rightward through the sibling chain. A [`Mutator`] is a cursor
//! whose leaf lock is exclusive; it appends insert and delete records to the
//! leaf's segment and queues the leaf for balancing.
//!
//! [`Iter`] is the lock-free-between-steps sequence built from fresh cursors.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use crate::buffer::Locked;
use crate::common::{Error, PageId, Result};
use crate::concurrency::LockMode;
use crate::index::btree::descent::{search_records, Descent, Seek, Stop};
use crate::index::btree::tree::Shared;
use crate::storage::page::{Header, Record};

/// A locked position in one leaf.
///
/// Records are addressed by index in `[offset(), count())`. Indexes below
/// `offset()` hold the page's ghost, which is never visible.
pub struct Cursor<'t> {
    shared: &'t Shared,
    page: Locked<'t>,
    index: usize,
    found: bool,
    offset: usize,
    count: usize,
    /// The seek key equals the page's leading key.
    leading: bool,
    advanced: bool,
    /// Right sibling locked to disambiguate an insert at the page's end.
    peeked: Option<Locked<'t>>,
}

impl<'t> Cursor<'t> {
    /// Descend to the leaf holding `key`, or the leftmost leaf for `None`,
    /// and lock it in `mode`.
    pub(crate) fn open(shared: &'t Shared, key: Option<&[u8]>, mode: LockMode) -> Result<Self> {
        shared.check_open()?;
        loop {
            match Cursor::seek(shared, key, mode) {
                Err(Error::RaceInvalidated(_)) => continue,
                other => return other,
            }
        }
    }

    fn seek(shared: &'t Shared, key: Option<&[u8]>, mode: LockMode) -> Result<Self> {
        let seek = key.map_or(Seek::Leftmost, Seek::Key);
        let mut descent = Descent::new(shared, LockMode::Shared);
        descent.descend(seek, Stop::Penultimate)?;
        if mode == LockMode::Exclusive {
            descent.exclude();
        }
        descent.descend(seek, Stop::Leaf)?;

        let (index, found) = (descent.index(), descent.found());
        let page = descent.into_locked()?;
        let (offset, count, leading) = {
            let leaf = page.page()?;
            let leading = match (key, leaf.leading_key()) {
                (Some(key), Some(first)) => shared.compare(key, first) == Ordering::Equal,
                _ => false,
            };
            (leaf.ghosts(), leaf.len(), leading)
        };
        Ok(Cursor {
            shared,
            page,
            index,
            found,
            offset,
            count,
            leading,
            advanced: false,
            peeked: None,
        })
    }

    /// Index of the sought key, or where it would be inserted.
    pub fn index(&self) -> usize {
        self.index
    }

    /// True if the seek key is present on this page.
    pub fn found(&self) -> bool {
        self.found
    }

    /// First live index.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Item count of the page, ghost included.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    /// The record at `index`.
    ///
    /// # Errors
    /// `Error::IndexOutOfRange` unless `offset() <= index < count()`.
    pub fn get(&self, index: usize) -> Result<Record> {
        if index < self.offset || index >= self.count {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.count,
            });
        }
        let page = self.page.page()?;
        page.records()
            .get(index)
            .cloned()
            .ok_or(Error::IndexOutOfRange {
                index,
                len: page.len(),
            })
    }

    /// Binary search among the live records of this page.
    pub fn index_of(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let page = self.page.page()?;
        Ok(search_records(self.shared, page.records(), page.ghosts(), key))
    }

    /// Move to the right sibling.
    ///
    /// The sibling is locked before the current page is released. Returns
    /// false at the rightmost leaf.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(right) = self.page.page()?.right() else {
            return Ok(false);
        };
        let mode = self.page.mode();
        let next = match self.peeked.take() {
            Some(peeked) if peeked.id() == right && peeked.mode() == mode => peeked,
            _ => self.shared.cache.hold(right)?.lock(mode),
        };
        let (offset, count) = {
            let page = next.page()?;
            (page.ghosts(), page.len())
        };
        self.page = next;
        self.index = offset;
        self.found = false;
        self.offset = offset;
        self.count = count;
        self.leading = false;
        self.advanced = true;
        Ok(true)
    }

    pub(crate) fn locked(&self) -> &Locked<'t> {
        &self.page
    }
}

/// A cursor that can insert and remove records.
pub struct Mutator<'t> {
    cursor: Cursor<'t>,
}

impl<'t> Mutator<'t> {
    pub(crate) fn new(cursor: Cursor<'t>) -> Self {
        Mutator { cursor }
    }

    /// Insert a record at `index`.
    ///
    /// Returns false when the key belongs on another page, which the caller
    /// resolves by seeking again. An insert at the page's end is checked
    /// against the right sibling's leading key unless the seek key was this
    /// page's own leading key.
    ///
    /// # Errors
    /// `Error::IndexOutOfRange` unless `offset() <= index <= count()`.
    pub fn insert(&mut self, index: usize, key: &[u8], value: &[u8]) -> Result<bool> {
        let shared = self.cursor.shared;
        let (id, len, ghosts, right, first, file) = {
            let page = self.cursor.page.page()?;
            (
                page.id(),
                page.len(),
                page.ghosts(),
                page.right(),
                page.records().first().map(|record| record.key.clone()),
                page.file.clone(),
            )
        };
        if index < ghosts || index > len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        if id != PageId::FIRST_LEAF {
            if let Some(first) = first {
                if shared.compare(key, &first) == Ordering::Less {
                    return Ok(false);
                }
            }
        }

        let ambiguous = index == len && !(self.cursor.leading && !self.cursor.advanced);
        if let (true, Some(right)) = (ambiguous, right) {
            let peeked = match self.cursor.peeked.take() {
                Some(peeked) if peeked.id() == right => peeked,
                _ => shared.cache.hold(right)?.lock(self.cursor.page.mode()),
            };
            let boundary = peeked
                .page()?
                .records()
                .first()
                .map(|record| record.key.clone());
            self.cursor.peeked = Some(peeked);
            if let Some(boundary) = boundary {
                if shared.compare(key, &boundary) != Ordering::Less {
                    return Ok(false);
                }
            }
        }

        let file = file.ok_or_else(|| Error::corrupt(id, "leaf has no segment"))?;
        let frame = shared.store().frame(&Header::Insert { index }, &[key, value])?;
        shared.append(id, &file, &frame)?;
        {
            let mut page = self.cursor.page.page()?;
            if let Some(records) = page.records_mut() {
                records.insert(index, Record::new(key, value));
            }
            self.cursor.count = page.len();
        }
        self.mark()?;
        Ok(true)
    }

    /// Remove the record at `index`. The leading record of any leaf but the
    /// leftmost becomes a ghost.
    ///
    /// # Errors
    /// `Error::IndexOutOfRange` unless `offset() <= index < count()`.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        let shared = self.cursor.shared;
        let (id, len, ghosts, file) = {
            let page = self.cursor.page.page()?;
            (page.id(), page.len(), page.ghosts(), page.file.clone())
        };
        if index < ghosts || index >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }

        let file = file.ok_or_else(|| Error::corrupt(id, "leaf has no segment"))?;
        let frame = shared.store().frame(&Header::Delete { index }, &[])?;
        shared.append(id, &file, &frame)?;
        {
            let mut page = self.cursor.page.page()?;
            page.delete(index);
            self.cursor.offset = page.ghosts();
            self.cursor.count = page.len();
        }
        self.mark()
    }

    /// Overwrite the value of the record at `index`, keeping its key.
    /// Returns the previous value.
    ///
    /// One `replace` record is appended, so a torn write leaves either the
    /// old record or the new one.
    ///
    /// # Errors
    /// `Error::IndexOutOfRange` unless `offset() <= index < count()`.
    pub fn replace(&mut self, index: usize, value: &[u8]) -> Result<Vec<u8>> {
        let shared = self.cursor.shared;
        let record = self.cursor.get(index)?;
        let (id, file) = {
            let page = self.cursor.page.page()?;
            (page.id(), page.file.clone())
        };

        let file = file.ok_or_else(|| Error::corrupt(id, "leaf has no segment"))?;
        let frame = shared
            .store()
            .frame(&Header::Replace { index }, &[record.key.as_slice(), value])?;
        shared.append(id, &file, &frame)?;
        self.cursor
            .page
            .page()?
            .replace(index, Record::new(record.key, value))
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.cursor.count,
            })?;
        Ok(record.value)
    }

    /// Queue the page for balancing if it needs a split, merge or ghost
    /// deletion.
    fn mark(&self) -> Result<()> {
        let shared = self.cursor.shared;
        let (id, live, ghosts, sole) = {
            let page = self.cursor.page.page()?;
            let sole = page.id() == PageId::FIRST_LEAF && page.right().is_none();
            (page.id(), page.live(), page.ghosts(), sole)
        };
        let order = shared.options.leaf;
        if live >= order.split || (live <= order.merge && !sole) || ghosts > 0 {
            shared.balancer.enqueue(id);
        }
        Ok(())
    }

    pub(crate) fn locked(&self) -> &Locked<'t> {
        self.cursor.locked()
    }
}

impl<'t> Deref for Mutator<'t> {
    type Target = Cursor<'t>;

    fn deref(&self) -> &Cursor<'t> {
        &self.cursor
    }
}

impl DerefMut for Mutator<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cursor
    }
}

// ============================================================================
// Iter
// ============================================================================

/// Records in key order.
///
/// Each refill opens a fresh cursor at the last key returned and copies out
/// one leaf, so no lock is held between calls to `next`. Records inserted
/// behind the iterator are not revisited.
pub struct Iter<'t> {
    shared: &'t Shared,
    start: Option<Vec<u8>>,
    last: Option<Vec<u8>>,
    buffer: VecDeque<Record>,
    done: bool,
}

impl<'t> Iter<'t> {
    pub(crate) fn new(shared: &'t Shared, start: Option<Vec<u8>>) -> Self {
        Iter {
            shared,
            start,
            last: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let seek = self.last.as_deref().or(self.start.as_deref());
        let mut cursor = Cursor::open(self.shared, seek, LockMode::Shared)?;
        loop {
            {
                let page = cursor.page.page()?;
                let records = page.records().get(cursor.index()..).unwrap_or_default();
                for record in records {
                    let after = self.last.as_deref().map_or(true, |last| {
                        self.shared.compare(&record.key, last) == Ordering::Greater
                    });
                    if after {
                        self.buffer.push_back(record.clone());
                    }
                }
            }
            if !self.buffer.is_empty() {
                return Ok(());
            }
            if !cursor.advance()? {
                self.done = true;
                return Ok(());
            }
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(err) = self.fill() {
                self.done = true;
                return Some(Err(err));
            }
        }
        let record = self.buffer.pop_front()?;
        self.last = Some(record.key.clone());
        Some(Ok(record))
    }
}
