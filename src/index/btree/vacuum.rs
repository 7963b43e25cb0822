//! Vacuum - leaf compaction and segment garbage collection.
//!
//! Splits, merges and ghost deletions leave a leaf with a short stub
//! segment that loads older segments. Compaction replaces the stub with one
//! self-contained segment; collection then unlinks every segment nothing
//! still needs.
//!
//! A segment can go when it is not the current segment of a live page and
//! every segment that depends on it can go too. `Dependent` markers
//! appended to a loaded segment name the segments that load it.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, trace};

use crate::buffer::Handle;
use crate::common::{PageId, Result};
use crate::index::btree::tree::Shared;
use crate::storage::Segment;

/// Longest chain of dependents followed before a segment is kept anyway.
const MAX_DEPTH: usize = 64;

/// Rewrite a held leaf as a single segment and collect what it replaced.
///
/// The caller holds the leaf exclusively.
pub(crate) fn compact(shared: &Shared, handle: &Handle<'_>) -> Result<()> {
    let store = shared.store();
    let (id, bytes, previous) = {
        let page = handle.page()?;
        if !page.is_leaf() {
            return Ok(());
        }
        (page.id(), store.encode_leaf(&page)?, page.file.clone())
    };

    let segment = store.next_segment();
    let mut commit = shared.journal.begin();
    commit.write(store.page_file(id, &segment.to_string()), &bytes)?;
    shared.commit(commit)?;
    handle.page()?.file = Some(segment.to_string());
    debug!(target: "strata::store", page = id.0, %segment, "compacted leaf");

    match previous.and_then(|previous| previous.parse::<Segment>().ok()) {
        Some(previous) => collect(shared, id, previous),
        None => Ok(()),
    }
}

/// Unlink `segment` and whatever it loads, as far as nothing else needs
/// them. Directories of retired pages go once they are empty.
pub(crate) fn collect(shared: &Shared, id: PageId, segment: Segment) -> Result<()> {
    let _collecting = shared.collecting();
    let store = shared.store();

    let mut verdicts = HashMap::new();
    let mut visited = HashSet::new();
    let mut doomed = Vec::new();
    let mut queue = vec![(id, segment)];
    while let Some((page, segment)) = queue.pop() {
        if !visited.insert((page, segment)) {
            continue;
        }
        if !deletable(shared, page, segment, &mut verdicts, 0)? {
            continue;
        }
        doomed.push((page, segment));
        queue.extend(store.references(page, segment)?.loads);
    }
    if doomed.is_empty() {
        return Ok(());
    }

    let mut emptied = Vec::new();
    let mut commit = shared.journal.begin();
    for &(page, segment) in &doomed {
        commit.unlink(store.page_file(page, &segment.to_string()));
    }
    let pages: HashSet<PageId> = doomed.iter().map(|&(page, _)| page).collect();
    for page in pages {
        if !shared.is_retired(page) {
            continue;
        }
        let all = store.segments(page)?;
        if all.iter().all(|segment| doomed.contains(&(page, *segment))) {
            commit.remove_dir(store.page_dir(page));
            emptied.push(page);
        }
    }
    shared.commit(commit)?;

    for page in &emptied {
        shared.forget_retired(*page);
    }
    debug!(
        target: "strata::store",
        segments = doomed.len(),
        pages = emptied.len(),
        "collected segments"
    );
    Ok(())
}

/// Retire every page directory the tree no longer reaches and collect what
/// it holds.
///
/// A crash between a merge's commit and the collection that follows leaves
/// the merged-away leaf's directory behind. Its segments may still be loaded
/// by a live leaf that was not yet compacted; those stay until it is.
pub(crate) fn sweep(shared: &Shared) -> Result<()> {
    let store = shared.store();
    let mut reachable = HashSet::new();
    let mut stack = vec![PageId::ROOT];
    while let Some(id) = stack.pop() {
        if !reachable.insert(id) || id.is_leaf() {
            continue;
        }
        stack.extend(store.read(id)?.children().iter().map(|child| child.id));
    }

    let mut orphans: Vec<PageId> = store
        .page_ids()?
        .into_iter()
        .filter(|id| !reachable.contains(id))
        .collect();
    orphans.sort();
    for &id in &orphans {
        let segments = if id.is_leaf() { store.segments(id)? } else { Vec::new() };
        if segments.is_empty() {
            let mut commit = shared.journal.begin();
            commit.remove_dir(store.page_dir(id));
            shared.commit(commit)?;
            continue;
        }
        shared.retire(id);
        for segment in segments {
            collect(shared, id, segment)?;
        }
    }
    if !orphans.is_empty() {
        info!(target: "strata::store", pages = orphans.len(), "swept unreachable pages");
    }
    Ok(())
}

fn deletable(
    shared: &Shared,
    id: PageId,
    segment: Segment,
    verdicts: &mut HashMap<(PageId, Segment), bool>,
    depth: usize,
) -> Result<bool> {
    if let Some(&verdict) = verdicts.get(&(id, segment)) {
        return Ok(verdict);
    }
    let store = shared.store();
    if depth > MAX_DEPTH || !store.segment_exists(id, segment) {
        return Ok(false);
    }
    // Provisional answer for dependency cycles.
    verdicts.insert((id, segment), false);

    let current = !shared.is_retired(id) && store.segments(id)?.last() == Some(&segment);
    let mut verdict = !current;
    if verdict {
        for (dependent, of) in store.references(id, segment)?.dependents {
            if !store.segment_exists(dependent, of) {
                continue;
            }
            if !deletable(shared, dependent, of, verdicts, depth + 1)? {
                trace!(
                    target: "strata::store",
                    page = id.0,
                    %segment,
                    dependent = dependent.0,
                    "segment still loaded"
                );
                verdict = false;
                break;
            }
        }
    }
    verdicts.insert((id, segment), verdict);
    Ok(verdict)
}
