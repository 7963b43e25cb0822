//! Balancer - splits and merges the pages cursors have queued.
//!
//! Cursors queue a leaf when it reaches the split threshold, falls to the
//! merge threshold, or gains a ghost. Structural operations queue the
//! branches they change. A pass takes the whole queue, turns it into a plan
//! sorted by key, and executes each action under its own descents, while a
//! fresh queue collects candidates for the next pass.
//!
//! Only one pass runs at a time. That is what allows the balancer to
//! upgrade branch locks and to lock branches reentrantly: nothing else ever
//! takes a branch lock exclusively.

mod merge;
mod split;

use std::cmp::Ordering as KeyOrdering;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::BalancerRef;
use crate::common::{Error, PageId, Result};
use crate::index::btree::descent::{leftmost_leaf, Seek};
use crate::index::btree::tree::Shared;
use crate::storage::journal::Commit;
use crate::storage::page::{Page, Summary};
use crate::storage::Segment;

/// Passes in a row that may commit nothing before `drain` gives up on the
/// remaining candidates.
const STALL_LIMIT: usize = 16;

/// Queue of pages awaiting balance.
pub(crate) struct Balancer {
    candidates: Mutex<HashSet<PageId>>,
    /// Pages whose merge found no room, queued once more for the next pass.
    deferred: Mutex<HashSet<PageId>>,
    running: Mutex<()>,
}

impl Balancer {
    pub(crate) fn new() -> Self {
        Balancer {
            candidates: Mutex::new(HashSet::new()),
            deferred: Mutex::new(HashSet::new()),
            running: Mutex::new(()),
        }
    }

    pub(crate) fn enqueue(&self, id: PageId) {
        self.candidates.lock().insert(id);
    }

    pub(crate) fn remove(&self, id: PageId) {
        self.candidates.lock().remove(&id);
    }

    pub(crate) fn contains(&self, id: PageId) -> bool {
        self.candidates.lock().contains(&id)
    }

    /// True if no page is queued.
    pub(crate) fn is_idle(&self) -> bool {
        self.candidates.lock().is_empty()
    }

    /// Queue a page whose merge found no room for one more pass. A page
    /// that finds no room twice in a row is dropped until a cursor queues it
    /// again. Returns true if the page was queued.
    pub(crate) fn defer(&self, id: PageId) -> bool {
        let mut deferred = self.deferred.lock();
        if deferred.remove(&id) {
            return false;
        }
        deferred.insert(id);
        self.enqueue(id);
        true
    }

    /// Forget a deferral once the page has merged.
    pub(crate) fn settle(&self, id: PageId) {
        self.deferred.lock().remove(&id);
    }

    fn take(&self) -> HashSet<PageId> {
        std::mem::take(&mut *self.candidates.lock())
    }
}

/// How a planned page is found again at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// The page is on the tree's left edge.
    Leftmost,
    /// Least key beneath the page.
    Key(Vec<u8>),
}

impl Route {
    fn from_key(key: Option<Vec<u8>>) -> Self {
        key.map_or(Route::Leftmost, Route::Key)
    }

    pub(crate) fn seek(&self) -> Seek<'_> {
        match self {
            Route::Leftmost => Seek::Leftmost,
            Route::Key(key) => Seek::Key(key),
        }
    }

    fn compare(&self, other: &Route, shared: &Shared) -> KeyOrdering {
        match (self, other) {
            (Route::Leftmost, Route::Leftmost) => KeyOrdering::Equal,
            (Route::Leftmost, Route::Key(_)) => KeyOrdering::Less,
            (Route::Key(_), Route::Leftmost) => KeyOrdering::Greater,
            (Route::Key(left), Route::Key(right)) => shared.compare(left, right),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    SplitLeaf,
    DeleteGhost,
    MergeLeaf,
    /// Split, merge, drain or fill, decided against the branch's current
    /// child count.
    Branch,
}

struct Planned<'t> {
    id: PageId,
    route: Route,
    action: Action,
    reference: BalancerRef<'t>,
}

/// State of one pass.
#[derive(Default)]
pub(super) struct Pass {
    /// Pages that already took part in a merge.
    used: HashSet<PageId>,
}

// ============================================================================
// Passes
// ============================================================================

/// Run one pass over the pages queued so far.
///
/// # Errors
/// Any error other than a race aborts the pass; the unexecuted part of the
/// plan is queued again.
pub(crate) fn balance(shared: &Shared) -> Result<()> {
    let _running = shared.balancer.running.lock();
    let candidates = shared.balancer.take();
    if candidates.is_empty() {
        return Ok(());
    }
    debug!(target: "strata::balance", candidates = candidates.len(), "balancing");

    let plan = match gather(shared, &candidates) {
        Ok(plan) => plan,
        Err(err) => {
            for id in candidates {
                shared.balancer.enqueue(id);
            }
            return Err(err);
        }
    };

    let mut pass = Pass::default();
    let mut plan = plan.into_iter();
    while let Some(planned) = plan.next() {
        if gone(shared, planned.id) || planned.reference.entry().is_deleted() {
            continue;
        }
        match execute(shared, &mut pass, &planned) {
            Ok(()) => {}
            Err(Error::RaceInvalidated(raced)) => {
                warn!(
                    target: "strata::balance",
                    page = planned.id.0,
                    raced = raced.0,
                    action = ?planned.action,
                    "plan invalidated, requeued"
                );
                shared.balancer.enqueue(planned.id);
            }
            Err(err) => {
                shared.balancer.enqueue(planned.id);
                for rest in plan {
                    shared.balancer.enqueue(rest.id);
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Balance until the queue is empty.
///
/// A pass already running on another thread is waited for, since its plan
/// has left the queue but may still queue follow-up work.
pub(crate) fn drain(shared: &Shared) -> Result<()> {
    let mut stalled = 0;
    loop {
        {
            let _running = shared.balancer.running.lock();
            if shared.balancer.is_idle() {
                return Ok(());
            }
        }
        let before = shared.cache.stats().commits.load(Ordering::Relaxed);
        balance(shared)?;
        if shared.cache.stats().commits.load(Ordering::Relaxed) != before {
            stalled = 0;
            continue;
        }
        stalled += 1;
        if stalled >= STALL_LIMIT {
            warn!(target: "strata::balance", "drain made no progress, giving up");
            return Ok(());
        }
    }
}

/// Freeze the candidates into a plan, holding a balancer reference on each.
fn gather<'t>(shared: &'t Shared, candidates: &HashSet<PageId>) -> Result<Vec<Planned<'t>>> {
    let mut plan = Vec::new();
    for &id in candidates {
        if gone(shared, id) {
            shared.balancer.settle(id);
            continue;
        }

        let handle = shared.cache.hold(id)?;
        let reference = shared.cache.reference(&handle);
        let summary = handle
            .entry()
            .summary()
            .ok_or_else(|| Error::corrupt(id, "held page has no summary"))?;
        drop(handle);

        let (action, route) = if id.is_leaf() {
            match leaf_action(shared, id, &summary) {
                Some(action) => (action, Route::from_key(summary.key)),
                None => {
                    shared.balancer.settle(id);
                    continue;
                }
            }
        } else {
            match leftmost_leaf(shared, id, true) {
                Ok((_, key)) => (Action::Branch, Route::from_key(key)),
                Err(Error::RaceInvalidated(_)) => {
                    shared.balancer.enqueue(id);
                    continue;
                }
                Err(err) => return Err(err),
            }
        };
        plan.push(Planned {
            id,
            route,
            action,
            reference,
        });
    }
    plan.sort_by(|left, right| left.route.compare(&right.route, shared));
    Ok(plan)
}

fn leaf_action(shared: &Shared, id: PageId, summary: &Summary) -> Option<Action> {
    let order = shared.options.leaf;
    let sole = id == PageId::FIRST_LEAF && summary.right.is_none();
    if summary.live() >= order.split {
        Some(Action::SplitLeaf)
    } else if summary.ghosts > 0 && summary.live() > 0 {
        Some(Action::DeleteGhost)
    } else if summary.live() <= order.merge && !sole {
        Some(Action::MergeLeaf)
    } else {
        None
    }
}

/// Carry out one planned action.
///
/// The route is found again first. Actions earlier in the pass can change
/// the least key beneath a page, and the key frozen into the plan would then
/// lead somewhere else.
fn execute(shared: &Shared, pass: &mut Pass, planned: &Planned<'_>) -> Result<()> {
    let id = planned.id;
    let route = &route_of(shared, id)?;
    match planned.action {
        Action::SplitLeaf => split::split_leaf(shared, id, route),
        Action::DeleteGhost => merge::delete_ghost(shared, id, route),
        Action::MergeLeaf => merge::merge_leaf(shared, pass, id, route),
        Action::Branch => balance_branch(shared, pass, id, route),
    }
}

fn balance_branch(shared: &Shared, pass: &mut Pass, id: PageId, route: &Route) -> Result<()> {
    let (len, first) = {
        let handle = shared.cache.hold(id)?;
        let page = handle.page()?;
        (page.len(), page.children().first().map(|child| child.id))
    };
    let order = shared.options.branch;
    if id == PageId::ROOT {
        if len >= order.split {
            return split::drain_root(shared);
        }
        if len == 1 && first.is_some_and(|child| child.is_branch()) {
            return merge::fill_root(shared);
        }
        return Ok(());
    }
    if len >= order.split {
        split::split_branch(shared, id, route)
    } else if len <= order.merge {
        merge::merge_branch(shared, pass, id, route)
    } else {
        Ok(())
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// The current route to a page: its own leading key for a leaf, the leading
/// key of its leftmost leaf for a branch.
fn route_of(shared: &Shared, id: PageId) -> Result<Route> {
    let key = if id.is_leaf() {
        let handle = shared.cache.hold(id)?;
        let key = handle.page()?.leading_key().map(<[u8]>::to_vec);
        key
    } else {
        leftmost_leaf(shared, id, true)?.1
    };
    Ok(Route::from_key(key))
}

/// True if the page has left the tree.
fn gone(shared: &Shared, id: PageId) -> bool {
    shared.is_retired(id)
        || !shared.store().exists(id)
        || shared.cache.peek(id).is_some_and(|entry| entry.is_deleted())
}

/// A descent by a page's route did not reach it. Unless the page has left
/// the tree, the action is retried in the next pass.
fn missed(shared: &Shared, id: PageId) -> Result<()> {
    if gone(shared, id) {
        debug!(target: "strata::balance", page = id.0, "planned page left the tree");
        return Ok(());
    }
    Err(Error::RaceInvalidated(id))
}

/// Stage a branch's new content and drop its previous file.
fn rewrite_branch(shared: &Shared, commit: &mut Commit<'_>, page: &mut Page) -> Result<()> {
    let store = shared.store();
    let (name, bytes) = store.encode_branch(page)?;
    if page.file.as_deref() == Some(name.as_str()) {
        return Ok(());
    }
    commit.write(store.page_file(page.id(), &name), &bytes)?;
    if let Some(old) = page.file.take() {
        commit.unlink(store.page_file(page.id(), &old));
    }
    page.file = Some(name);
    Ok(())
}

/// Stage a branch that does not exist on disk yet.
fn create_branch(shared: &Shared, commit: &mut Commit<'_>, page: &mut Page) -> Result<()> {
    commit.make_dir(shared.store().page_dir(page.id()));
    rewrite_branch(shared, commit, page)
}

/// Current segment of a leaf.
fn segment_of(page: &Page) -> Result<Segment> {
    page.file
        .as_deref()
        .and_then(|file| file.parse().ok())
        .ok_or_else(|| Error::corrupt(page.id(), "leaf has no current segment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::concurrency::LockMode;
    use crate::index::btree::cursor::{Cursor, Iter, Mutator};
    use crate::index::btree::tree::tests_support::{create_test_shared, split_first_leaf};
    use crate::index::btree::verify;

    fn insert(shared: &Shared, key: &str) {
        loop {
            let mut mutator =
                Mutator::new(Cursor::open(shared, Some(key.as_bytes()), LockMode::Exclusive).unwrap());
            let index = match mutator.index_of(key.as_bytes()).unwrap() {
                Ok(index) | Err(index) => index,
            };
            if mutator.insert(index, key.as_bytes(), key.as_bytes()).unwrap() {
                return;
            }
        }
    }

    fn remove(shared: &Shared, key: &str) {
        let mut mutator =
            Mutator::new(Cursor::open(shared, Some(key.as_bytes()), LockMode::Exclusive).unwrap());
        let index = mutator.index_of(key.as_bytes()).unwrap().unwrap();
        mutator.remove(index).unwrap();
    }

    fn keys(shared: &Shared) -> Vec<String> {
        Iter::new(shared, None)
            .map(|record| String::from_utf8(record.unwrap().key).unwrap())
            .collect()
    }

    #[test]
    fn test_queue() {
        let balancer = Balancer::new();
        assert!(balancer.is_idle());
        balancer.enqueue(PageId::new(3));
        balancer.enqueue(PageId::new(3));
        assert!(balancer.contains(PageId::new(3)));
        assert_eq!(balancer.take().len(), 1);
        assert!(balancer.is_idle());
    }

    #[test]
    fn test_defer_requeues_once() {
        let balancer = Balancer::new();
        let id = PageId::new(5);
        assert!(balancer.defer(id));
        assert!(balancer.contains(id));
        balancer.take();
        assert!(!balancer.defer(id));
        assert!(balancer.is_idle());

        assert!(balancer.defer(id));
        balancer.settle(id);
        balancer.take();
        assert!(balancer.defer(id));
    }

    #[test]
    fn test_missed_page_is_retried_unless_gone() {
        let (shared, _dir) = create_test_shared(5);
        let right = split_first_leaf(&shared, &["a"], &["m"], true);
        assert!(matches!(
            missed(&shared, right),
            Err(Error::RaceInvalidated(raced)) if raced == right
        ));
        shared.retire(right);
        missed(&shared, right).unwrap();
    }

    #[test]
    fn test_stale_route_is_found_again() {
        let (shared, _dir) = create_test_shared(5);
        let right = split_first_leaf(&shared, &["a", "b"], &["m", "n", "o", "p", "q"], true);
        let handle = shared.cache.hold(right).unwrap();
        let planned = Planned {
            id: right,
            route: Route::Key(b"zz".to_vec()),
            action: Action::SplitLeaf,
            reference: shared.cache.reference(&handle),
        };
        drop(handle);

        execute(&shared, &mut Pass::default(), &planned).unwrap();
        let report = verify::verify(&shared).unwrap();
        assert_eq!(report.leaves, 3);
        assert_eq!(keys(&shared), vec!["a", "b", "m", "n", "o", "p", "q"]);
    }

    #[test]
    fn test_merge_without_room_is_requeued_once() {
        let (shared, _dir) = create_test_shared(5);
        let right = split_first_leaf(&shared, &["a", "b", "c", "d"], &["m", "n"], true);
        remove(&shared, "n");
        assert!(shared.balancer.contains(right));

        // Four and one would fill a page, so the merge waits.
        balance(&shared).unwrap();
        assert!(shared.balancer.contains(right));
        balance(&shared).unwrap();
        assert!(shared.balancer.is_idle());
        assert_eq!(verify::verify(&shared).unwrap().leaves, 2);

        // Once the left leaf has room, the next touch merges the pair.
        remove(&shared, "d");
        remove(&shared, "c");
        insert(&shared, "o");
        remove(&shared, "o");
        drain(&shared).unwrap();
        assert!(!shared.store().exists(right));
        let report = verify::verify(&shared).unwrap();
        assert_eq!(report.leaves, 1);
        assert_eq!(keys(&shared), vec!["a", "b", "m"]);
    }

    #[test]
    fn test_split_leaf_into_two() {
        let (shared, _dir) = create_test_shared(5);
        for key in ["a", "b", "c", "d", "e"] {
            insert(&shared, key);
        }
        assert!(shared.balancer.contains(PageId::FIRST_LEAF));
        drain(&shared).unwrap();

        let report = verify::verify(&shared).unwrap();
        assert_eq!(report.leaves, 2);
        assert_eq!(report.height, 1);
        assert_eq!(keys(&shared), vec!["a", "b", "c", "d", "e"]);

        let root = shared.store().read(PageId::ROOT).unwrap();
        assert_eq!(root.children().len(), 2);
        assert_eq!(root.children()[1].key.as_deref(), Some(&b"d"[..]));
    }

    #[test]
    fn test_overgrown_leaf_splits_many_ways() {
        let (shared, _dir) = create_test_shared(5);
        for key in ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k"] {
            insert(&shared, key);
        }
        drain(&shared).unwrap();

        let report = verify::verify(&shared).unwrap();
        assert_eq!(report.records, 11);
        assert!(report.leaves >= 3);
        assert_eq!(keys(&shared).len(), 11);
    }

    #[test]
    fn test_root_drains_and_height_grows() {
        let (shared, _dir) = create_test_shared(3);
        for key in ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"] {
            insert(&shared, key);
            drain(&shared).unwrap();
        }
        let report = verify::verify(&shared).unwrap();
        assert!(report.height > 1);
        assert_eq!(
            keys(&shared),
            vec!["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]
        );
    }

    #[test]
    fn test_merge_into_left_sibling() {
        let (shared, _dir) = create_test_shared(5);
        let right = split_first_leaf(&shared, &["a", "b", "c"], &["d", "e"], true);
        remove(&shared, "e");
        drain(&shared).unwrap();

        assert!(shared.cache.peek(right).is_none());
        assert!(!shared.store().exists(right));
        let report = verify::verify(&shared).unwrap();
        assert_eq!(report.leaves, 1);
        assert_eq!(keys(&shared), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_ghost_is_deleted() {
        let (shared, _dir) = create_test_shared(5);
        let right = split_first_leaf(&shared, &["a", "b"], &["m", "n", "o"], true);
        remove(&shared, "m");
        drain(&shared).unwrap();

        let page = shared.store().read(right).unwrap();
        assert_eq!(page.ghosts(), 0);
        assert_eq!(page.leading_key(), Some(&b"n"[..]));
        let root = shared.store().read(PageId::ROOT).unwrap();
        assert_eq!(root.children()[1].key, None);
        verify::verify(&shared).unwrap();
        assert_eq!(keys(&shared), vec!["a", "b", "n", "o"]);
    }

    #[test]
    fn test_merges_collapse_tree() {
        let (shared, _dir) = create_test_shared(3);
        let all = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
        for key in all {
            insert(&shared, key);
            drain(&shared).unwrap();
        }
        for key in &all[1..] {
            remove(&shared, key);
            drain(&shared).unwrap();
        }
        let report = verify::verify(&shared).unwrap();
        assert_eq!(report.leaves, 1);
        assert_eq!(report.height, 1);
        assert_eq!(keys(&shared), vec!["a"]);
    }
}
