//! Tree - the public handle on one on-disk B+tree.

use std::cmp::Ordering as KeyOrdering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use crate::buffer::{PageCache, StatsSnapshot};
use crate::common::{Checksum, Error, Options, Order, PageId, Result};
use crate::concurrency::LockMode;
use crate::index::btree::balancer::{self, Balancer};
use crate::index::btree::cursor::{Cursor, Iter, Mutator};
use crate::index::btree::descent::{Descent, Seek, Stop};
use crate::index::btree::vacuum;
use crate::index::btree::verify::{self, Report};
use crate::storage::{Commit, Journal, PageStore, Recovery};

/// State shared by every cursor, the balancer and the background worker.
pub(crate) struct Shared {
    pub(crate) cache: PageCache,
    pub(crate) journal: Journal,
    pub(crate) options: Options,
    pub(crate) balancer: Balancer,
    next_leaf: AtomicU64,
    next_branch: AtomicU64,
    /// Leaves merged away whose directories still await garbage collection.
    retired: Mutex<HashSet<PageId>>,
    collecting: Mutex<()>,
    closed: AtomicBool,
    /// First error raised by the background balancer.
    failure: Mutex<Option<Error>>,
}

impl Shared {
    fn new(store: PageStore, journal: Journal, options: Options) -> Result<Self> {
        let max = store.max_page_id()?.0;
        let next_leaf = if max % 2 == 1 { max + 2 } else { max + 1 };
        let next_branch = if max % 2 == 0 { max + 2 } else { max + 1 };
        Ok(Shared {
            cache: PageCache::new(store, options.cache_size),
            journal,
            options,
            balancer: Balancer::new(),
            next_leaf: AtomicU64::new(next_leaf),
            next_branch: AtomicU64::new(next_branch),
            retired: Mutex::new(HashSet::new()),
            collecting: Mutex::new(()),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    #[inline]
    pub(crate) fn store(&self) -> &PageStore {
        self.cache.store()
    }

    /// A fresh page id of the requested kind.
    pub(crate) fn allocate(&self, leaf: bool) -> PageId {
        let counter = if leaf { &self.next_leaf } else { &self.next_branch };
        PageId::new(counter.fetch_add(2, Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn compare(&self, left: &[u8], right: &[u8]) -> KeyOrdering {
        self.options.compare(left, right)
    }

    /// Run a journaled commit and count it.
    pub(crate) fn commit(&self, commit: Commit<'_>) -> Result<()> {
        commit.commit()?;
        self.cache.stats().commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append encoded frames to a leaf segment and count the bytes.
    pub(crate) fn append(&self, id: PageId, segment: &str, bytes: &[u8]) -> Result<()> {
        self.store().append(id, segment, bytes)?;
        self.cache
            .stats()
            .bytes_appended
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn retire(&self, id: PageId) {
        self.retired.lock().insert(id);
    }

    pub(crate) fn is_retired(&self, id: PageId) -> bool {
        self.retired.lock().contains(&id)
    }

    pub(crate) fn forget_retired(&self, id: PageId) {
        self.retired.lock().remove(&id);
    }

    /// Serializes segment garbage collection.
    pub(crate) fn collecting(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.collecting.lock()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn fail(&self, err: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }
}

// ============================================================================
// Background balancer
// ============================================================================

#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

struct Worker {
    signal: Arc<Signal>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn spawn(shared: &Arc<Shared>, interval: Duration) -> Result<Worker> {
        let weak = Arc::downgrade(shared);
        let signal = Arc::new(Signal::default());
        let thread = thread::Builder::new()
            .name("strata-balancer".into())
            .spawn({
                let signal = Arc::clone(&signal);
                move || Worker::run(weak, signal, interval)
            })?;
        Ok(Worker { signal, thread })
    }

    fn run(weak: Weak<Shared>, signal: Arc<Signal>, interval: Duration) {
        loop {
            {
                let mut stopped = signal.stopped.lock();
                if !*stopped {
                    signal.wake.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    return;
                }
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.balancer.is_idle() {
                continue;
            }
            if let Err(err) = balancer::balance(&shared) {
                error!(target: "strata::balance", error = %err, "background balance failed");
                shared.fail(err);
                return;
            }
        }
    }

    fn stop(self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        let _ = self.thread.join();
    }
}

// ============================================================================
// Tree
// ============================================================================

/// An embedded, persistent, concurrent B+tree.
///
/// `Tree` is `Send + Sync`; share it between threads by reference or `Arc`.
/// Every read and write goes through a [`Cursor`], which holds a lock on
/// one leaf. Structural changes happen in the balancer, either on the
/// background thread or through [`Tree::balance`] and [`Tree::drain`].
///
/// # Example
/// ```no_run
/// use strata::{Options, Tree};
///
/// let tree = Tree::create("/tmp/strata-example", Options::default()).unwrap();
/// tree.insert(b"a", b"alpha").unwrap();
/// assert_eq!(tree.get(b"a").unwrap().as_deref(), Some(&b"alpha"[..]));
/// tree.close().unwrap();
/// ```
pub struct Tree {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Tree {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Create a new, empty tree in `dir`.
    ///
    /// # Errors
    /// - `Error::InvalidConfiguration` if `options` fail validation
    /// - `Error::DirectoryNotEmpty` if `dir` already holds files
    pub fn create(dir: impl AsRef<Path>, options: Options) -> Result<Tree> {
        options.validate()?;
        let store = PageStore::create(dir.as_ref(), options.checksum, options.sync)?;
        let journal = Journal::new(dir.as_ref(), options.sync)?;
        Tree::start(Shared::new(store, journal, options)?)
    }

    /// Open an existing tree, completing or discarding an interrupted commit.
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<Tree> {
        options.validate()?;
        let store = PageStore::open(dir.as_ref(), options.checksum, options.sync)?;
        let journal = Journal::new(dir.as_ref(), options.sync)?;
        let recovery = journal.recover()?;
        if recovery != Recovery::Clean {
            info!(target: "strata::journal", ?recovery, "recovered interrupted commit");
        }
        let shared = Shared::new(store, journal, options)?;
        vacuum::sweep(&shared)?;
        Tree::start(shared)
    }

    fn start(shared: Shared) -> Result<Tree> {
        let shared = Arc::new(shared);
        let worker = match shared.options.balance_interval {
            Some(interval) => Some(Worker::spawn(&shared, interval)?),
            None => None,
        };
        Ok(Tree {
            shared,
            worker: Mutex::new(worker),
        })
    }

    // ========================================================================
    // Cursors
    // ========================================================================

    /// A read cursor on the leaf that holds, or would hold, `key`.
    pub fn search(&self, key: &[u8]) -> Result<Cursor<'_>> {
        Cursor::open(&self.shared, Some(key), LockMode::Shared)
    }

    /// A read cursor on the leftmost leaf.
    pub fn first(&self) -> Result<Cursor<'_>> {
        Cursor::open(&self.shared, None, LockMode::Shared)
    }

    /// A write cursor on the leaf that holds, or would hold, `key`.
    pub fn search_mut(&self, key: &[u8]) -> Result<Mutator<'_>> {
        Cursor::open(&self.shared, Some(key), LockMode::Exclusive).map(Mutator::new)
    }

    // ========================================================================
    // Record operations
    // ========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cursor = self.search(key)?;
        match cursor.index_of(key)? {
            Ok(index) => Ok(Some(cursor.get(index)?.value)),
            Err(_) => Ok(None),
        }
    }

    /// Insert a record, replacing any record with the same key. Returns the
    /// replaced record.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        loop {
            let mut mutator = self.search_mut(key)?;
            match mutator.index_of(key)? {
                Ok(index) => return mutator.replace(index, value).map(Some),
                Err(index) => {
                    if mutator.insert(index, key, value)? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Insert a record under the key the configured extractor derives.
    pub fn put(&self, value: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = (self.shared.options.extractor)(value);
        self.insert(&key, value)
    }

    /// Remove the record with `key`. Returns the removed record.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut mutator = self.search_mut(key)?;
        match mutator.index_of(key)? {
            Ok(index) => {
                let record = mutator.get(index)?;
                mutator.remove(index)?;
                Ok(Some(record.value))
            }
            Err(_) => Ok(None),
        }
    }

    /// All records in key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(&self.shared, None)
    }

    /// Records with keys at or after `key`, in key order.
    pub fn range_from(&self, key: &[u8]) -> Iter<'_> {
        Iter::new(&self.shared, Some(key.to_vec()))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Run one balancing pass over the queued candidates.
    pub fn balance(&self) -> Result<()> {
        self.shared.check_open()?;
        balancer::balance(&self.shared)
    }

    /// Balance until no candidates remain.
    pub fn drain(&self) -> Result<()> {
        self.shared.check_open()?;
        balancer::drain(&self.shared)
    }

    /// Rewrite the leaf holding `key` as one self-contained segment.
    pub fn vacuum(&self, key: &[u8]) -> Result<()> {
        let mutator = self.search_mut(key)?;
        vacuum::compact(&self.shared, mutator.locked().handle())
    }

    /// Evict cached pages until total heft is at most `down_to`.
    pub fn purge(&self, down_to: usize) {
        self.shared.cache.purge(down_to);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.cache.stats().snapshot()
    }

    /// Walk the whole tree and check its structural invariants.
    ///
    /// Meaningful at a quiescent point: with no cursor or balancer
    /// operation in flight and after [`Tree::drain`].
    pub fn verify(&self) -> Result<Report> {
        self.shared.check_open()?;
        verify::verify(&self.shared)
    }

    /// Number of levels below the root.
    pub fn height(&self) -> Result<usize> {
        self.shared.check_open()?;
        loop {
            let mut descent = Descent::new(&self.shared, LockMode::Shared);
            match descent.descend(Seek::Leftmost, Stop::Leaf) {
                Ok(()) => return Ok(descent.depth()),
                Err(Error::RaceInvalidated(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Stop the background balancer, drain, and report any background
    /// failure. Later operations fail with `Error::Closed`.
    pub fn close(&self) -> Result<()> {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
        self.shared.check_open()?;
        if let Some(err) = self.shared.failure.lock().take() {
            self.shared.closed.store(true, Ordering::Release);
            return Err(err);
        }
        let drained = balancer::drain(&self.shared);
        self.shared.closed.store(true, Ordering::Release);
        drained
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.stop();
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects the directory and options of a tree.
///
/// # Example
/// ```no_run
/// use strata::{Order, Tree};
///
/// let tree = Tree::builder()
///     .directory("/tmp/strata-builder")
///     .leaf(Order::new(64, 16))
///     .balance_interval(None)
///     .create()
///     .unwrap();
/// # drop(tree);
/// ```
#[derive(Default)]
pub struct Builder {
    directory: Option<PathBuf>,
    options: Options,
}

impl Builder {
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn leaf(mut self, order: Order) -> Self {
        self.options.leaf = order;
        self
    }

    pub fn branch(mut self, order: Order) -> Self {
        self.options.branch = order;
        self
    }

    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.options.cache_size = cache_size;
        self
    }

    pub fn comparator(
        mut self,
        comparator: impl Fn(&[u8], &[u8]) -> KeyOrdering + Send + Sync + 'static,
    ) -> Self {
        self.options.comparator = Arc::new(comparator);
        self
    }

    pub fn extractor(mut self, extractor: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.options.extractor = Arc::new(extractor);
        self
    }

    pub fn checksum(mut self, checksum: Checksum) -> Self {
        self.options.checksum = checksum;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.options.sync = sync;
        self
    }

    pub fn balance_interval(mut self, interval: Option<Duration>) -> Self {
        self.options.balance_interval = interval;
        self
    }

    /// # Errors
    /// `Error::OptionRequired("directory")` if no directory was given.
    pub fn create(self) -> Result<Tree> {
        let directory = self.directory.ok_or(Error::OptionRequired("directory"))?;
        Tree::create(directory, self.options)
    }

    pub fn open(self) -> Result<Tree> {
        let directory = self.directory.ok_or(Error::OptionRequired("directory"))?;
        Tree::open(directory, self.options)
    }
}
