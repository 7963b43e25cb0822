//! Splits: leaf, branch and root drain.
//!
//! A page at or past its split threshold is cut into `max(2, ceil(n /
//! (split - 1)))` pieces of nearly equal size, the earlier pieces taking the
//! remainder. The first piece keeps the page's identity; the others become
//! new pages referenced from the parent right after the original.

use tracing::debug;

use crate::common::{Error, PageId, Result};
use crate::concurrency::LockMode;
use crate::index::btree::balancer::{create_branch, missed, rewrite_branch, segment_of, Route};
use crate::index::btree::descent::{derive_key, Descent, Seek, Stop};
use crate::index::btree::tree::Shared;
use crate::index::btree::vacuum;
use crate::storage::page::{Child, Header, Items, Page};

/// Piece sizes for `len` items, in key order.
pub(super) fn partition(len: usize, split: usize) -> Vec<usize> {
    let pages = len.div_ceil(split.saturating_sub(1).max(1)).max(2);
    let base = len / pages;
    let extra = len % pages;
    (0..pages).map(|page| base + usize::from(page < extra)).collect()
}

/// Take the first child's key as the key of the piece it leads, deriving it
/// if it was never set. The first child of a page carries no key.
fn promote(shared: &Shared, piece: &mut [Child]) -> Result<Vec<u8>> {
    let Some(first) = piece.first_mut() else {
        return Err(Error::corrupt(PageId::ROOT, "empty branch piece"));
    };
    match first.key.take() {
        Some(key) => Ok(key),
        None => derive_key(shared, first.id, true),
    }
}

/// Cut `children` into pieces of the given sizes.
fn cut(mut children: Vec<Child>, sizes: &[usize]) -> Vec<Vec<Child>> {
    let mut pieces = Vec::with_capacity(sizes.len());
    for &size in sizes {
        let rest = children.split_off(size.min(children.len()));
        pieces.push(std::mem::replace(&mut children, rest));
    }
    pieces
}

/// Split a leaf, writing stub segments that slice its current segment.
pub(super) fn split_leaf(shared: &Shared, id: PageId, route: &Route) -> Result<()> {
    let store = shared.store();
    let mut parent = Descent::new(shared, LockMode::Shared);
    parent.descend(route.seek(), Stop::ParentOf(id))?;
    if parent.page()?.is_leaf() {
        drop(parent);
        return missed(shared, id);
    }
    parent.upgrade()?;
    let at = parent.index();
    let mut fork = parent.fork()?;
    fork.exclude();
    fork.step(at)?;
    let leaf = fork.into_locked()?;

    let order = shared.options.leaf;
    let page = leaf.page()?.clone();
    if page.live() < order.split {
        return Ok(());
    }
    let mut sizes = partition(page.live(), order.split);
    sizes[0] += page.ghosts();
    let old = segment_of(&page)?;
    let records = page.records();

    let mut ids = vec![id];
    ids.extend((1..sizes.len()).map(|_| shared.allocate(true)));

    let mut parent_page = parent.page()?.clone();
    let mut commit = shared.journal.begin();
    let mut pieces = Vec::with_capacity(sizes.len());
    let mut markers = Vec::new();
    let mut start = 0;
    for (index, &size) in sizes.iter().enumerate() {
        let piece = ids[index];
        let end = start + size;
        let right = ids.get(index + 1).copied().or(page.right());
        let segment = store.next_segment();

        let mut stub = store.frame(&Header::Load { id, segment: old }, &[])?;
        stub.extend(store.frame(&Header::Slice { index: start, length: end }, &[])?);
        stub.extend(store.frame(&Header::Right { id: right }, &[])?);
        if piece != PageId::FIRST_LEAF {
            stub.extend(store.frame(&Header::Key, &[records[start].key.as_slice()])?);
        }
        if index > 0 {
            commit.make_dir(store.page_dir(piece));
            if let Some(children) = parent_page.children_mut() {
                children.insert(
                    at + index,
                    Child::new(piece, Some(records[start].key.clone())),
                );
            }
        }
        commit.write(store.page_file(piece, &segment.to_string()), &stub)?;
        markers.extend(store.frame(&Header::Dependent { id: piece, segment }, &[])?);

        let mut new = Page::leaf(piece);
        new.items = Items::Leaf(records[start..end].to_vec());
        new.ghosts = if index == 0 { page.ghosts() } else { 0 };
        new.right = right;
        new.file = Some(segment.to_string());
        pieces.push(new);
        start = end;
    }
    shared.append(id, &old.to_string(), &markers)?;
    rewrite_branch(shared, &mut commit, &mut parent_page)?;
    shared.commit(commit)?;

    let mut pieces = pieces.into_iter();
    if let Some(first) = pieces.next() {
        *leaf.page()? = first;
    }
    let created: Vec<_> = pieces.map(|piece| shared.cache.create(piece)).collect();
    let parent_len = parent_page.len();
    let parent_id = parent_page.id();
    *parent.page()? = parent_page;
    debug!(
        target: "strata::balance",
        page = id.0,
        pieces = created.len() + 1,
        "split leaf"
    );

    for handle in &created {
        vacuum::compact(shared, handle)?;
    }
    vacuum::compact(shared, leaf.handle())?;
    if parent_len >= shared.options.branch.split {
        shared.balancer.enqueue(parent_id);
    }
    Ok(())
}

/// Split a branch other than the root.
pub(super) fn split_branch(shared: &Shared, id: PageId, route: &Route) -> Result<()> {
    let mut parent = Descent::new(shared, LockMode::Shared);
    parent.descend(route.seek(), Stop::ParentOf(id))?;
    if parent.page()?.is_leaf() {
        drop(parent);
        return missed(shared, id);
    }
    parent.upgrade()?;
    let at = parent.index();
    let mut fork = parent.fork()?;
    fork.exclude();
    fork.step(at)?;
    let branch = fork.into_locked()?;

    let order = shared.options.branch;
    let mut page = branch.page()?.clone();
    if page.len() < order.split {
        return Ok(());
    }
    let sizes = partition(page.len(), order.split);
    let mut pieces = cut(page.children().to_vec(), &sizes).into_iter();
    let first = pieces.next().unwrap_or_default();
    let mut keyed = Vec::new();
    for mut piece in pieces {
        let key = promote(shared, &mut piece)?;
        keyed.push((piece, key));
    }

    let mut parent_page = parent.page()?.clone();
    let mut commit = shared.journal.begin();
    let mut created = Vec::new();
    for (index, (piece, key)) in keyed.into_iter().enumerate() {
        let mut new = Page::branch(shared.allocate(false), piece);
        create_branch(shared, &mut commit, &mut new)?;
        if let Some(children) = parent_page.children_mut() {
            children.insert(at + index + 1, Child::new(new.id(), Some(key)));
        }
        created.push(new);
    }
    page.items = Items::Branch(first);
    rewrite_branch(shared, &mut commit, &mut page)?;
    rewrite_branch(shared, &mut commit, &mut parent_page)?;
    shared.commit(commit)?;

    let pieces = created.len() + 1;
    for new in created {
        drop(shared.cache.create(new));
    }
    *branch.page()? = page;
    let parent_len = parent_page.len();
    let parent_id = parent_page.id();
    *parent.page()? = parent_page;
    debug!(target: "strata::balance", page = id.0, pieces, "split branch");

    if parent_len >= order.split {
        shared.balancer.enqueue(parent_id);
    }
    Ok(())
}

/// Move the root's children into new branches beneath it, adding a level.
pub(super) fn drain_root(shared: &Shared) -> Result<()> {
    let mut root = Descent::new(shared, LockMode::Shared);
    root.descend(Seek::Leftmost, Stop::Depth(0))?;
    root.upgrade()?;

    let order = shared.options.branch;
    let mut page = root.page()?.clone();
    if page.len() < order.split {
        return Ok(());
    }
    let sizes = partition(page.len(), order.split);
    let mut keyed = Vec::new();
    for (index, mut piece) in cut(page.children().to_vec(), &sizes).into_iter().enumerate() {
        let key = if index == 0 {
            if let Some(first) = piece.first_mut() {
                first.key = None;
            }
            None
        } else {
            Some(promote(shared, &mut piece)?)
        };
        keyed.push((piece, key));
    }

    let mut commit = shared.journal.begin();
    let mut created = Vec::new();
    let mut children = Vec::new();
    for (piece, key) in keyed {
        let mut new = Page::branch(shared.allocate(false), piece);
        create_branch(shared, &mut commit, &mut new)?;
        children.push(Child::new(new.id(), key));
        created.push(new);
    }
    page.items = Items::Branch(children);
    rewrite_branch(shared, &mut commit, &mut page)?;
    shared.commit(commit)?;

    for new in created {
        drop(shared.cache.create(new));
    }
    let len = page.len();
    *root.page()? = page;
    debug!(target: "strata::balance", children = len, "drained root");

    if len >= order.split {
        shared.balancer.enqueue(PageId::ROOT);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_two_ways() {
        assert_eq!(partition(5, 5), vec![3, 2]);
        assert_eq!(partition(4, 5), vec![2, 2]);
        assert_eq!(partition(3, 3), vec![2, 1]);
    }

    #[test]
    fn test_partition_remainder_goes_left() {
        assert_eq!(partition(11, 5), vec![4, 4, 3]);
        assert_eq!(partition(13, 5), vec![4, 3, 3, 3]);
        for len in 2..64 {
            let sizes = partition(len, 5);
            assert_eq!(sizes.iter().sum::<usize>(), len);
            assert!(sizes.iter().all(|&size| size > 0 && size < 5));
            assert!(sizes.windows(2).all(|pair| pair[0] >= pair[1]));
        }
    }

    #[test]
    fn test_cut() {
        let children: Vec<_> = (0..5)
            .map(|id| Child::new(PageId::new(id * 2 + 1), None))
            .collect();
        let pieces = cut(children, &[2, 2, 1]);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[2][0].id, PageId::new(9));
    }
}
