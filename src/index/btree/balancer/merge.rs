//! Merges: leaf, branch, root fill and ghost deletion.
//!
//! A merge always folds the right page of a pair into the left one. The pair
//! is found from the right page's least key: the branch holding that key as
//! a separator is the pivot, and forks from the pivot reach the rightmost
//! page left of the separator and the leftmost page right of it. Every page
//! on both paths is locked exclusively, parent before child and left before
//! right.

use tracing::debug;

use crate::buffer::Locked;
use crate::common::{Error, PageId, Result};
use crate::concurrency::LockMode;
use crate::index::btree::balancer::{missed, rewrite_branch, segment_of, Pass, Route};
use crate::index::btree::descent::{Descent, Seek, Stop};
use crate::index::btree::tree::Shared;
use crate::index::btree::vacuum;
use crate::storage::page::{Header, Items, Page};

/// Depth of the pages being merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Leaf,
    /// Branches at this depth; the root is at depth 0.
    Branch(usize),
}

impl Level {
    fn stop(self) -> Stop {
        match self {
            Level::Leaf => Stop::Leaf,
            Level::Branch(depth) => Stop::Depth(depth),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Merged,
    /// The combined page would reach the split threshold.
    TooBig,
}

/// The planned page and its place in the pair a merge finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    /// The candidate folds into its left sibling.
    Right(PageId),
    /// The candidate takes in its right sibling.
    Left(PageId),
}

impl Candidate {
    fn id(self) -> PageId {
        match self {
            Candidate::Right(id) | Candidate::Left(id) => id,
        }
    }
}

/// Merge a leaf at or below the merge threshold: into its left sibling if
/// the pair fits, otherwise by taking in its right sibling.
pub(super) fn merge_leaf(shared: &Shared, pass: &mut Pass, id: PageId, route: &Route) -> Result<()> {
    let (live, right) = {
        let handle = shared.cache.hold(id)?;
        let page = handle.page()?;
        (page.live(), page.right())
    };
    if live > shared.options.leaf.merge {
        shared.balancer.settle(id);
        return Ok(());
    }

    let mut partnered = false;
    if let Route::Key(key) = route {
        partnered = true;
        if merge_into_left(shared, pass, key, Level::Leaf, Candidate::Right(id))? == Outcome::Merged {
            return Ok(());
        }
    }
    if let Some(right) = right {
        partnered = true;
        let key = leading_key(shared, right)?.ok_or(Error::RaceInvalidated(right))?;
        if merge_into_left(shared, pass, &key, Level::Leaf, Candidate::Left(id))? == Outcome::Merged {
            return Ok(());
        }
    }
    if partnered {
        defer(shared, id);
    }
    Ok(())
}

/// Merge a branch at or below the merge threshold with its lesser sibling
/// or, failing that, its greater sibling at the same depth.
pub(super) fn merge_branch(
    shared: &Shared,
    pass: &mut Pass,
    id: PageId,
    route: &Route,
) -> Result<()> {
    let mut locate = Descent::new(shared, LockMode::Shared);
    locate.descend(route.seek(), Stop::Address(id))?;
    if locate.page_id() != Some(id) {
        drop(locate);
        return missed(shared, id);
    }
    let depth = locate.depth();
    if locate.page()?.len() > shared.options.branch.merge {
        shared.balancer.settle(id);
        return Ok(());
    }
    drop(locate);

    let mut partnered = false;
    if let Route::Key(key) = route {
        partnered = true;
        let candidate = Candidate::Right(id);
        if merge_into_left(shared, pass, key, Level::Branch(depth), candidate)? == Outcome::Merged {
            return Ok(());
        }
    }

    let mut edge = Descent::new(shared, LockMode::Shared).reentrant();
    edge.descend(route.seek(), Stop::Address(id))?;
    edge.descend(Seek::Rightmost, Stop::Leaf)?;
    let right = edge.page()?.right();
    drop(edge);
    if let Some(right) = right {
        partnered = true;
        let key = leading_key(shared, right)?.ok_or(Error::RaceInvalidated(right))?;
        let candidate = Candidate::Left(id);
        if merge_into_left(shared, pass, &key, Level::Branch(depth), candidate)? == Outcome::Merged {
            return Ok(());
        }
    }
    if partnered {
        defer(shared, id);
    }
    Ok(())
}

fn defer(shared: &Shared, id: PageId) {
    let requeued = shared.balancer.defer(id);
    debug!(target: "strata::balance", page = id.0, requeued, "no room to merge");
}

fn leading_key(shared: &Shared, id: PageId) -> Result<Option<Vec<u8>>> {
    let handle = shared.cache.hold(id)?;
    let key = handle.page()?.leading_key().map(<[u8]>::to_vec);
    Ok(key)
}

/// Fold the page whose least key is `key` into the page left of it.
///
/// # Errors
/// `Error::RaceInvalidated` if the pair found is not the candidate's, or the
/// candidate no longer needs a merge.
fn merge_into_left(
    shared: &Shared,
    pass: &mut Pass,
    key: &[u8],
    level: Level,
    candidate: Candidate,
) -> Result<Outcome> {
    let store = shared.store();
    let mut pivot = Descent::new(shared, LockMode::Shared);
    pivot.descend(Seek::Key(key), Stop::Found)?;
    let at = pivot.index();
    if pivot.page()?.is_leaf() || !pivot.found() || at == 0 {
        return Err(Error::RaceInvalidated(candidate.id()));
    }
    pivot.upgrade()?;
    pivot.exclude();

    let mut left = pivot.fork()?;
    left.step(at - 1)?;
    left.descend(Seek::Rightmost, level.stop())?;
    let mut right = pivot.fork()?;
    right.retain(true);
    right.step(at)?;
    right.descend(Seek::Leftmost, level.stop())?;

    let left_id = left.handle()?.id();
    let right_id = right.handle()?.id();
    let expected = match candidate {
        Candidate::Right(id) => right_id == id,
        Candidate::Left(id) => left_id == id,
    };
    if !expected {
        return Err(Error::RaceInvalidated(candidate.id()));
    }
    if pass.used.contains(&left_id) || pass.used.contains(&right_id) {
        return Err(Error::RaceInvalidated(right_id));
    }
    let (mut merged, removed) = {
        let left_page = left.page()?;
        let right_page = right.page()?;
        let small = match candidate {
            Candidate::Right(_) => &right_page,
            Candidate::Left(_) => &left_page,
        };
        let needed = match level {
            Level::Leaf => small.live() <= shared.options.leaf.merge,
            Level::Branch(_) => small.len() <= shared.options.branch.merge,
        };
        if !needed {
            return Err(Error::RaceInvalidated(candidate.id()));
        }
        let fits = match level {
            Level::Leaf => left_page.live() + right_page.live() < shared.options.leaf.split,
            Level::Branch(_) => left_page.len() + right_page.len() < shared.options.branch.split,
        };
        if !fits {
            return Ok(Outcome::TooBig);
        }
        (left_page.clone(), right_page.clone())
    };

    // Unhook the right page. Branches that held nothing but the right
    // page's path go with it; the deepest branch left with children is the
    // splice.
    let path = right.take_retained();
    let lens = path
        .iter()
        .map(|branch| branch.page().map(|page| page.len()))
        .collect::<Result<Vec<_>>>()?;
    let splice = lens.iter().rposition(|&len| len > 1);
    let singles: Vec<PageId> = path[splice.map_or(0, |splice| splice + 1)..]
        .iter()
        .map(Locked::id)
        .collect();

    let mut pivot_page = pivot.page()?.clone();
    let mut splice_page = match splice {
        Some(splice) => Some(path[splice].page()?.clone()),
        None => None,
    };
    match splice_page.as_mut().and_then(Page::children_mut) {
        Some(children) => {
            children.remove(0);
            let next = children.first_mut().and_then(|child| child.key.take());
            if let Some(child) = pivot_page.children_mut().and_then(|c| c.get_mut(at)) {
                child.key = next;
            }
        }
        None => {
            if let Some(children) = pivot_page.children_mut() {
                children.remove(at);
            }
        }
    }

    let mut commit = shared.journal.begin();
    match level {
        Level::Leaf => {
            let left_old = segment_of(&merged)?;
            let right_old = segment_of(&removed)?;
            let segment = store.next_segment();
            let mut stub = store.frame(&Header::Load { id: left_id, segment: left_old }, &[])?;
            stub.extend(store.frame(&Header::Merge { id: right_id, segment: right_old }, &[])?);
            if let Some(leading) = merged.leading_key() {
                stub.extend(store.frame(&Header::Key, &[leading])?);
            }
            let marker = store.frame(&Header::Dependent { id: left_id, segment }, &[])?;
            shared.append(left_id, &left_old.to_string(), &marker)?;
            shared.append(right_id, &right_old.to_string(), &marker)?;
            commit.write(store.page_file(left_id, &segment.to_string()), &stub)?;

            let moved = removed.records()[removed.ghosts()..].to_vec();
            if let Some(records) = merged.records_mut() {
                records.extend(moved);
            }
            merged.right = removed.right();
            merged.file = Some(segment.to_string());
        }
        Level::Branch(_) => {
            let mut moved = removed.children().to_vec();
            if let Some(first) = moved.first_mut() {
                first.key = Some(key.to_vec());
            }
            if let Some(children) = merged.children_mut() {
                children.extend(moved);
            }
            rewrite_branch(shared, &mut commit, &mut merged)?;
            commit.remove_dir(store.page_dir(right_id));
        }
    }
    for &single in &singles {
        commit.remove_dir(store.page_dir(single));
    }
    if let Some(page) = splice_page.as_mut() {
        rewrite_branch(shared, &mut commit, page)?;
    }
    rewrite_branch(shared, &mut commit, &mut pivot_page)?;
    shared.commit(commit)?;
    if level == Level::Leaf {
        shared.retire(right_id);
    }

    *left.page()? = merged;
    right.handle()?.entry().mark_deleted();
    shared.balancer.remove(right_id);
    for branch in &path {
        if singles.contains(&branch.id()) {
            branch.entry().mark_deleted();
            shared.balancer.remove(branch.id());
        }
    }
    let splice_id = match (splice, splice_page) {
        (Some(splice), Some(page)) => {
            *path[splice].page()? = page;
            path[splice].id()
        }
        _ => pivot_page.id(),
    };
    *pivot.page()? = pivot_page;
    pass.used.insert(left_id);
    pass.used.insert(right_id);
    shared.balancer.settle(left_id);
    shared.balancer.settle(right_id);
    debug!(
        target: "strata::balance",
        left = left_id.0,
        right = right_id.0,
        removed = singles.len(),
        "merged"
    );

    if level == Level::Leaf {
        vacuum::compact(shared, left.handle()?)?;
    }
    shared.balancer.enqueue(splice_id);
    shared.balancer.enqueue(PageId::ROOT);
    Ok(Outcome::Merged)
}

/// Replace a root holding a single branch with that branch's children,
/// removing a level.
pub(super) fn fill_root(shared: &Shared) -> Result<()> {
    let mut root = Descent::new(shared, LockMode::Shared);
    root.descend(Seek::Leftmost, Stop::Depth(0))?;
    root.upgrade()?;
    root.exclude();

    let (len, child) = {
        let page = root.page()?;
        (page.len(), page.children().first().map(|child| child.id))
    };
    let Some(child) = child.filter(|child| len == 1 && child.is_branch()) else {
        return Ok(());
    };
    let mut fork = root.fork()?;
    fork.step(0)?;
    let children = fork.page()?.children().to_vec();

    let mut page = root.page()?.clone();
    page.items = Items::Branch(children);
    let mut commit = shared.journal.begin();
    rewrite_branch(shared, &mut commit, &mut page)?;
    commit.remove_dir(shared.store().page_dir(child));
    shared.commit(commit)?;

    let refill = page.len() == 1;
    *root.page()? = page;
    fork.handle()?.entry().mark_deleted();
    shared.balancer.remove(child);
    debug!(target: "strata::balance", child = child.0, "filled root");

    if refill {
        shared.balancer.enqueue(PageId::ROOT);
    }
    Ok(())
}

/// Drop a leaf's ghost once the leaf has a live record to take over its
/// key. The separator naming the old key is cleared and derived again on
/// demand.
pub(super) fn delete_ghost(shared: &Shared, id: PageId, route: &Route) -> Result<()> {
    let Route::Key(key) = route else {
        return Ok(());
    };
    let store = shared.store();
    let mut pivot = Descent::new(shared, LockMode::Shared);
    pivot.descend(Seek::Key(key), Stop::Found)?;
    if pivot.page()?.is_leaf() || !pivot.found() {
        drop(pivot);
        return missed(shared, id);
    }
    pivot.upgrade()?;
    pivot.exclude();
    let at = pivot.index();

    let mut fork = pivot.fork()?;
    fork.step(at)?;
    fork.descend(Seek::Leftmost, Stop::Leaf)?;
    let leaf = fork.into_locked()?;
    if leaf.id() != id {
        return Err(Error::RaceInvalidated(id));
    }
    let mut page = leaf.page()?.clone();
    if page.ghosts() == 0 || page.live() == 0 {
        return Ok(());
    }

    let old = segment_of(&page)?;
    let segment = store.next_segment();
    let len = page.len();
    let mut stub = store.frame(&Header::Load { id, segment: old }, &[])?;
    stub.extend(store.frame(&Header::Slice { index: 1, length: len }, &[])?);
    stub.extend(store.frame(&Header::Key, &[page.records()[1].key.as_slice()])?);
    let marker = store.frame(&Header::Dependent { id, segment }, &[])?;
    shared.append(id, &old.to_string(), &marker)?;

    let mut pivot_page = pivot.page()?.clone();
    if let Some(child) = pivot_page.children_mut().and_then(|c| c.get_mut(at)) {
        child.key = None;
    }
    let mut commit = shared.journal.begin();
    commit.write(store.page_file(id, &segment.to_string()), &stub)?;
    rewrite_branch(shared, &mut commit, &mut pivot_page)?;
    shared.commit(commit)?;

    if let Some(records) = page.records_mut() {
        records.remove(0);
    }
    page.ghosts = 0;
    page.file = Some(segment.to_string());
    let live = page.live();
    *leaf.page()? = page;
    *pivot.page()? = pivot_page;
    debug!(target: "strata::balance", page = id.0, "deleted ghost");

    vacuum::compact(shared, leaf.handle())?;
    if live <= shared.options.leaf.merge {
        shared.balancer.enqueue(id);
    }
    Ok(())
}
