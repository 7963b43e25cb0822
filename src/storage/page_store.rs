//! Page Store - file I/O for tree pages.
//!
//! The [`PageStore`] owns the on-disk layout of a tree directory:
//! ```text
//! <root>/
//!   pages/<id>/<instance>.<seq>   leaf append segments, newest wins
//!   pages/<id>/<crc32 hex>        branch content, one file per branch
//!   instances/<n>/                generation of the session that opened the tree
//!   journal/                      staged structural commits
//! ```
//!
//! Leaves are append-only logs of [`Header`] records. A segment may `load`,
//! `slice` and `merge` older segments (its own page's or another's), so
//! split and merge can write small stubs instead of copying records.
//! Branches are rewritten whole and named by the checksum of their content.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{info, trace, warn};

use crate::common::{Checksum, Error, PageId, Result};
use crate::storage::page::log_record::{self, FrameError, FrameReader};
use crate::storage::page::{BranchEntry, Child, Header, Items, Page, Record};
use crate::storage::segment::Segment;

const PAGES: &str = "pages";
const INSTANCES: &str = "instances";

/// Longest chain of `load`/`merge` references followed before the page is
/// declared corrupt.
const MAX_CHAIN: usize = 256;

/// Segments a leaf segment refers to, and segments that refer to it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentRefs {
    /// Segments named by `load` and `merge` records.
    pub loads: Vec<(PageId, Segment)>,
    /// Segments named by `dependent` records.
    pub dependents: Vec<(PageId, Segment)>,
}

/// Reads and writes the page files of one tree directory.
///
/// # Thread Safety
/// All methods take `&self`. Appends to a leaf are serialized by the leaf's
/// exclusive page lock; structural rewrites go through the journal.
pub struct PageStore {
    root: PathBuf,
    checksum: Checksum,
    sync: bool,
    instance: u64,
    next_seq: AtomicU64,
}

impl PageStore {
    /// Lay out a new, empty tree: a root branch over one empty leaf.
    ///
    /// # Errors
    /// Returns `Error::DirectoryNotEmpty` if `root` already holds files.
    pub fn create(root: impl Into<PathBuf>, checksum: Checksum, sync: bool) -> Result<Self> {
        let root = root.into();
        if root.exists() && fs::read_dir(&root)?.next().is_some() {
            return Err(Error::DirectoryNotEmpty(root));
        }
        fs::create_dir_all(root.join(INSTANCES).join("0"))?;

        let store = PageStore {
            root,
            checksum,
            sync,
            instance: 0,
            next_seq: AtomicU64::new(0),
        };

        let leaf = store.next_segment();
        let leaf_dir = store.root.join(store.page_dir(PageId::FIRST_LEAF));
        fs::create_dir_all(&leaf_dir)?;
        fs::File::create(leaf_dir.join(leaf.to_string()))?;

        let root_page = Page::branch(PageId::ROOT, vec![Child::new(PageId::FIRST_LEAF, None)]);
        let (name, bytes) = store.encode_branch(&root_page)?;
        let root_dir = store.root.join(store.page_dir(PageId::ROOT));
        fs::create_dir_all(&root_dir)?;
        fs::write(root_dir.join(name), bytes)?;

        info!(target: "strata::store", root = %store.root.display(), "created tree");
        Ok(store)
    }

    /// Open an existing tree directory as a new instance.
    ///
    /// The new instance number is one past the newest found; older instance
    /// directories are removed.
    pub fn open(root: impl Into<PathBuf>, checksum: Checksum, sync: bool) -> Result<Self> {
        let root = root.into();
        if !root.join(PAGES).is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} holds no tree", root.display()),
            )));
        }

        let instances = root.join(INSTANCES);
        fs::create_dir_all(&instances)?;
        let mut previous = Vec::new();
        for entry in fs::read_dir(&instances)? {
            let name = entry?.file_name();
            if let Some(n) = name.to_str().and_then(|name| name.parse::<u64>().ok()) {
                previous.push(n);
            }
        }
        let instance = previous.iter().max().map_or(0, |max| max + 1);
        fs::create_dir_all(instances.join(instance.to_string()))?;
        for n in previous {
            fs::remove_dir_all(instances.join(n.to_string()))?;
        }

        info!(target: "strata::store", root = %root.display(), instance, "opened tree");
        Ok(PageStore {
            root,
            checksum,
            sync,
            instance,
            next_seq: AtomicU64::new(0),
        })
    }

    // ========================================================================
    // Layout
    // ========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Directory of a page, relative to the tree root.
    pub fn page_dir(&self, id: PageId) -> String {
        format!("{PAGES}/{id}")
    }

    /// Path of a file in a page directory, relative to the tree root.
    pub fn page_file(&self, id: PageId, name: &str) -> String {
        format!("{PAGES}/{id}/{name}")
    }

    /// A segment name newer than every segment written so far.
    pub fn next_segment(&self) -> Segment {
        Segment::new(self.instance, self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Ids of every page directory on disk, in no particular order.
    pub fn page_ids(&self) -> Result<Vec<PageId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(PAGES))? {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(|name| name.parse::<u64>().ok()) {
                ids.push(PageId::new(id));
            }
        }
        Ok(ids)
    }

    /// Largest page id present on disk.
    pub fn max_page_id(&self) -> Result<PageId> {
        let max = self.page_ids()?.into_iter().max();
        Ok(max.map_or(PageId::FIRST_LEAF, |max| max.max(PageId::FIRST_LEAF)))
    }

    /// Segments of a leaf, oldest first. Empty if the page directory is gone.
    pub fn segments(&self, id: PageId) -> Result<Vec<Segment>> {
        let dir = self.root.join(self.page_dir(id));
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut segments = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(segment) = name.to_str().and_then(|name| name.parse::<Segment>().ok()) {
                segments.push(segment);
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// True if the page has a directory on disk.
    pub fn exists(&self, id: PageId) -> bool {
        self.root.join(self.page_dir(id)).is_dir()
    }

    pub fn segment_exists(&self, id: PageId, segment: Segment) -> bool {
        self.root
            .join(self.page_file(id, &segment.to_string()))
            .exists()
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode one frame with this store's checksum.
    pub fn frame<H: Serialize>(&self, header: &H, parts: &[&[u8]]) -> Result<Vec<u8>> {
        log_record::encode(self.checksum, header, parts)
    }

    /// Encode a leaf as a self-contained segment.
    pub fn encode_leaf(&self, page: &Page) -> Result<Vec<u8>> {
        let mut bytes = self.frame(&Header::Right { id: page.right }, &[])?;
        for (index, record) in page.records().iter().enumerate() {
            bytes.extend(self.frame(&Header::Insert { index }, &[&record.key, &record.value])?);
        }
        if page.ghosts > 0 {
            bytes.extend(self.frame(&Header::Delete { index: 0 }, &[])?);
        }
        if let Some(key) = page.leading_key() {
            bytes.extend(self.frame(&Header::Key, &[key])?);
        }
        Ok(bytes)
    }

    /// Encode a branch. Returns the content-addressed file name and bytes.
    pub fn encode_branch(&self, page: &Page) -> Result<(String, Vec<u8>)> {
        let mut bytes = Vec::new();
        for child in page.children() {
            let parts: Vec<&[u8]> = child.key.iter().map(Vec::as_slice).collect();
            bytes.extend(self.frame(&BranchEntry { id: child.id }, &parts)?);
        }
        let name = format!("{:08x}", crc32fast::hash(&bytes));
        Ok((name, bytes))
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Load a page.
    ///
    /// # Errors
    /// - `Error::CorruptPage` on a checksum or structural failure
    /// - `Error::Io` if the page's files cannot be read
    pub fn read(&self, id: PageId) -> Result<Page> {
        trace!(target: "strata::store", page = id.0, "reading page");
        if id.is_leaf() {
            self.read_leaf(id)
        } else {
            self.read_branch(id)
        }
    }

    fn read_branch(&self, id: PageId) -> Result<Page> {
        let dir = self.root.join(self.page_dir(id));
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            if let Some(name) = entry?.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        let name = match names.as_slice() {
            [name] => name.clone(),
            [] => return Err(Error::corrupt(id, "branch has no content file")),
            _ => return Err(Error::corrupt(id, format!("branch has {} content files", names.len()))),
        };

        let bytes = fs::read(dir.join(&name))?;
        if self.checksum != Checksum::None && format!("{:08x}", crc32fast::hash(&bytes)) != name {
            return Err(Error::corrupt(id, format!("branch file {name} fails its checksum")));
        }

        let mut children = Vec::new();
        let mut reader = FrameReader::new(&bytes, self.checksum);
        loop {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(FrameError::Torn { offset }) => {
                    return Err(Error::corrupt(id, format!("branch truncated at {offset}")))
                }
                Err(FrameError::Corrupt { offset, reason }) => {
                    return Err(Error::corrupt(id, format!("{reason} at {offset}")))
                }
            };
            let entry: BranchEntry = frame
                .header()
                .map_err(|err| Error::corrupt(id, format!("bad branch entry: {err}")))?;
            let key = match frame.parts.as_slice() {
                [] => None,
                [key] => Some(key.to_vec()),
                _ => return Err(Error::corrupt(id, "branch entry has extra parts")),
            };
            children.push(Child::new(entry.id, key));
        }
        if children.is_empty() {
            return Err(Error::corrupt(id, "branch has no children"));
        }

        let mut page = Page::branch(id, children);
        page.file = Some(name);
        Ok(page)
    }

    fn read_leaf(&self, id: PageId) -> Result<Page> {
        let segment = self
            .segments(id)?
            .pop()
            .ok_or_else(|| Error::corrupt(id, "leaf has no segments"))?;
        let mut page = self.replay(id, segment, true, 0)?;
        page.id = id;
        page.file = Some(segment.to_string());
        Ok(page)
    }

    /// Replay one segment. Only the current segment of a page is repaired
    /// when its tail is torn; older segments are never appended to.
    fn replay(&self, id: PageId, segment: Segment, current: bool, depth: usize) -> Result<Page> {
        if depth > MAX_CHAIN {
            return Err(Error::corrupt(id, "segment chain too long"));
        }
        let path = self.root.join(self.page_file(id, &segment.to_string()));
        let bytes = fs::read(&path)?;

        let mut page = Page::leaf(id);
        let mut key: Option<Vec<u8>> = None;
        let mut reader = FrameReader::new(&bytes, self.checksum);
        loop {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(FrameError::Torn { offset }) => {
                    if current {
                        warn!(
                            target: "strata::store",
                            page = id.0,
                            %segment,
                            offset,
                            discarded = bytes.len() - offset,
                            "discarding torn tail"
                        );
                        let file = OpenOptions::new().write(true).open(&path)?;
                        file.set_len(offset as u64)?;
                        if self.sync {
                            file.sync_all()?;
                        }
                    }
                    break;
                }
                Err(FrameError::Corrupt { offset, reason }) => {
                    return Err(Error::corrupt(
                        id,
                        format!("segment {segment}: {reason} at {offset}"),
                    ))
                }
            };
            let header: Header = frame
                .header()
                .map_err(|err| Error::corrupt(id, format!("segment {segment}: {err}")))?;
            self.apply(&mut page, &mut key, header, &frame.parts, depth)?;
        }

        if let Some(key) = key {
            if page.records().first().map(|record| &record.key) != Some(&key) {
                return Err(Error::corrupt(id, format!("segment {segment}: leading key mismatch")));
            }
        }
        Ok(page)
    }

    fn apply(
        &self,
        page: &mut Page,
        key: &mut Option<Vec<u8>>,
        header: Header,
        parts: &[&[u8]],
        depth: usize,
    ) -> Result<()> {
        let id = page.id;
        let len = page.len();
        match header {
            Header::Insert { index } => {
                let [record_key, value] = parts else {
                    return Err(Error::corrupt(id, "insert record needs key and value"));
                };
                if index > len {
                    return Err(Error::corrupt(id, format!("insert at {index} past {len}")));
                }
                if let Some(records) = page.records_mut() {
                    records.insert(index, Record::new(*record_key, *value));
                }
            }
            Header::Delete { index } => {
                if index >= len {
                    return Err(Error::corrupt(id, format!("delete at {index} past {len}")));
                }
                page.delete(index);
            }
            Header::Replace { index } => {
                let [record_key, value] = parts else {
                    return Err(Error::corrupt(id, "replace record needs key and value"));
                };
                if page.replace(index, Record::new(*record_key, *value)).is_none() {
                    return Err(Error::corrupt(id, format!("replace at {index} past {len}")));
                }
            }
            Header::Right { id: right } => page.right = right,
            Header::Key => {
                let [record_key] = parts else {
                    return Err(Error::corrupt(id, "key record needs one part"));
                };
                *key = Some(record_key.to_vec());
            }
            Header::Load { id: from, segment } => {
                let loaded = self.replay(from, segment, false, depth + 1)?;
                page.items = loaded.items;
                page.ghosts = loaded.ghosts;
                page.right = loaded.right;
            }
            Header::Merge { id: from, segment } => {
                let loaded = self.replay(from, segment, false, depth + 1)?;
                let skip = loaded.ghosts;
                if let (Some(records), Items::Leaf(merged)) = (page.records_mut(), loaded.items) {
                    records.extend(merged.into_iter().skip(skip));
                }
                page.right = loaded.right;
            }
            Header::Slice { index, length } => {
                if index > length || length > len {
                    return Err(Error::corrupt(
                        id,
                        format!("slice {index}..{length} of {len} items"),
                    ));
                }
                if let Some(records) = page.records_mut() {
                    records.truncate(length);
                    records.drain(..index);
                }
                if index > 0 || page.is_empty() {
                    page.ghosts = 0;
                }
            }
            Header::Dependent { .. } => {}
        }
        Ok(())
    }

    /// Scan a segment for its references, tolerating a torn tail.
    pub fn references(&self, id: PageId, segment: Segment) -> Result<SegmentRefs> {
        let path = self.root.join(self.page_file(id, &segment.to_string()));
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(SegmentRefs::default()),
            Err(err) => return Err(err.into()),
        };
        let mut refs = SegmentRefs::default();
        let mut reader = FrameReader::new(&bytes, self.checksum);
        while let Ok(Some(frame)) = reader.next_frame() {
            match frame.header::<Header>() {
                Ok(Header::Load { id, segment }) | Ok(Header::Merge { id, segment }) => {
                    refs.loads.push((id, segment))
                }
                Ok(Header::Dependent { id, segment }) => refs.dependents.push((id, segment)),
                _ => {}
            }
        }
        Ok(refs)
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Append encoded frames to a leaf segment.
    ///
    /// On a failed write the segment is cut back to its previous length, so
    /// a partial frame never sits in front of later appends.
    pub fn append(&self, id: PageId, segment: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(self.page_file(id, segment));
        let mut file = OpenOptions::new().append(true).open(&path)?;
        let before = file.metadata()?.len();
        let written = file.write_all(bytes).and_then(|()| {
            if self.sync {
                file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            if let Err(rollback) = file.set_len(before) {
                warn!(
                    target: "strata::store",
                    page = id.0,
                    segment,
                    error = %rollback,
                    "could not cut back a failed append"
                );
            }
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> (PageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::create(dir.path().join("tree"), Checksum::Crc32, false).unwrap();
        (store, dir)
    }

    fn insert(store: &PageStore, id: PageId, segment: &str, index: usize, key: &str) {
        let frame = store
            .frame(&Header::Insert { index }, &[key.as_bytes(), key.as_bytes()])
            .unwrap();
        store.append(id, segment, &frame).unwrap();
    }

    fn keys(page: &Page) -> Vec<String> {
        page.records()
            .iter()
            .map(|record| String::from_utf8(record.key.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_create_lays_out_empty_tree() {
        let (store, _dir) = create_test_store();

        let root = store.read(PageId::ROOT).unwrap();
        assert_eq!(root.children(), &[Child::new(PageId::FIRST_LEAF, None)]);

        let leaf = store.read(PageId::FIRST_LEAF).unwrap();
        assert!(leaf.is_leaf());
        assert!(leaf.is_empty());
        assert_eq!(leaf.file.as_deref(), Some("0.0"));
        assert_eq!(store.max_page_id().unwrap(), PageId::FIRST_LEAF);
    }

    #[test]
    fn test_create_refuses_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stray"), b"x").unwrap();
        let result = PageStore::create(dir.path(), Checksum::Crc32, false);
        assert!(matches!(result, Err(Error::DirectoryNotEmpty(_))));
    }

    #[test]
    fn test_open_rotates_instances() {
        let (store, dir) = create_test_store();
        let root = store.root().to_path_buf();
        drop(store);

        let store = PageStore::open(&root, Checksum::Crc32, false).unwrap();
        assert_eq!(store.instance(), 1);
        let store = PageStore::open(&root, Checksum::Crc32, false).unwrap();
        assert_eq!(store.instance(), 2);
        let instances: Vec<_> = fs::read_dir(root.join(INSTANCES))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(instances, vec![std::ffi::OsString::from("2")]);
        assert!(store.next_segment() > Segment::new(1, 1000));
        drop(dir);
    }

    #[test]
    fn test_replay_insert_and_delete() {
        let (store, _dir) = create_test_store();
        let leaf = PageId::FIRST_LEAF;
        insert(&store, leaf, "0.0", 0, "b");
        insert(&store, leaf, "0.0", 0, "a");
        insert(&store, leaf, "0.0", 2, "c");
        let delete = store.frame(&Header::Delete { index: 1 }, &[]).unwrap();
        store.append(leaf, "0.0", &delete).unwrap();
        let replace = store
            .frame(&Header::Replace { index: 1 }, &[&b"c"[..], &b"cherry"[..]])
            .unwrap();
        store.append(leaf, "0.0", &replace).unwrap();

        let page = store.read(leaf).unwrap();
        assert_eq!(keys(&page), vec!["a", "c"]);
        assert_eq!(page.records()[1].value, b"cherry");
    }

    #[test]
    fn test_replace_past_end_is_corrupt() {
        let (store, _dir) = create_test_store();
        let leaf = PageId::FIRST_LEAF;
        insert(&store, leaf, "0.0", 0, "a");
        let replace = store.frame(&Header::Replace { index: 1 }, &[&b"b"[..], &b"b"[..]]).unwrap();
        store.append(leaf, "0.0", &replace).unwrap();
        assert!(matches!(store.read(leaf), Err(Error::CorruptPage { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_reports_write_error_when_cut_back_fails() {
        if !Path::new("/dev/full").exists() {
            return;
        }
        let (store, _dir) = create_test_store();
        let leaf = PageId::FIRST_LEAF;
        // Writes to /dev/full fail, and so does cutting it back.
        let path = store.root().join(store.page_file(leaf, "0.9"));
        std::os::unix::fs::symlink("/dev/full", &path).unwrap();
        let frame = store.frame(&Header::Insert { index: 0 }, &[&b"a"[..], &b"a"[..]]).unwrap();
        let err = store.append(leaf, "0.9", &frame).unwrap_err();
        assert!(matches!(err, Error::Io(ref io) if io.kind() != std::io::ErrorKind::InvalidInput));
    }

    #[test]
    fn test_torn_tail_is_discarded_and_truncated() {
        let (store, _dir) = create_test_store();
        let leaf = PageId::FIRST_LEAF;
        insert(&store, leaf, "0.0", 0, "a");
        let path = store.root().join(store.page_file(leaf, "0.0"));
        let good = fs::metadata(&path).unwrap().len();
        insert(&store, leaf, "0.0", 1, "b");
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good + 5).unwrap();

        let page = store.read(leaf).unwrap();
        assert_eq!(keys(&page), vec!["a"]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good);

        // Appends after the repair stay readable.
        insert(&store, leaf, "0.0", 1, "c");
        assert_eq!(keys(&store.read(leaf).unwrap()), vec!["a", "c"]);
    }

    #[test]
    fn test_stub_segments_load_slice_and_merge() {
        let (store, _dir) = create_test_store();
        let left = PageId::FIRST_LEAF;
        for (index, key) in ["a", "b", "c", "d"].iter().enumerate() {
            insert(&store, left, "0.0", index, key);
        }

        // Split 1 into [a, b] and 3 = [c, d].
        let right = PageId::new(3);
        fs::create_dir_all(store.root().join(store.page_dir(right))).unwrap();
        let base = Segment::new(0, 0);
        let mut stub = store.frame(&Header::Load { id: left, segment: base }, &[]).unwrap();
        stub.extend(store.frame(&Header::Slice { index: 2, length: 4 }, &[]).unwrap());
        stub.extend(store.frame(&Header::Key, &[b"c"]).unwrap());
        fs::write(store.root().join(store.page_file(right, "0.1")), stub).unwrap();

        let mut stub = store.frame(&Header::Load { id: left, segment: base }, &[]).unwrap();
        stub.extend(store.frame(&Header::Slice { index: 0, length: 2 }, &[]).unwrap());
        stub.extend(store.frame(&Header::Right { id: Some(right) }, &[]).unwrap());
        fs::write(store.root().join(store.page_file(left, "0.2")), stub).unwrap();

        let page = store.read(right).unwrap();
        assert_eq!(keys(&page), vec!["c", "d"]);
        let page = store.read(left).unwrap();
        assert_eq!(keys(&page), vec!["a", "b"]);
        assert_eq!(page.right(), Some(right));

        // Ghost the leading record of 3, then merge 3 back into 1.
        let delete = store.frame(&Header::Delete { index: 0 }, &[]).unwrap();
        store.append(right, "0.1", &delete).unwrap();
        let ghosted = store.read(right).unwrap();
        assert_eq!(ghosted.ghosts(), 1);

        let mut stub = store
            .frame(&Header::Load { id: left, segment: Segment::new(0, 2) }, &[])
            .unwrap();
        stub.extend(
            store
                .frame(&Header::Merge { id: right, segment: Segment::new(0, 1) }, &[])
                .unwrap(),
        );
        fs::write(store.root().join(store.page_file(left, "0.3")), stub).unwrap();
        let merged = store.read(left).unwrap();
        assert_eq!(keys(&merged), vec!["a", "b", "d"]);
        assert_eq!(merged.right(), None);

        let refs = store.references(left, Segment::new(0, 3)).unwrap();
        assert_eq!(
            refs.loads,
            vec![(left, Segment::new(0, 2)), (right, Segment::new(0, 1))]
        );
    }

    #[test]
    fn test_key_mismatch_is_corrupt() {
        let (store, _dir) = create_test_store();
        let id = PageId::new(3);
        fs::create_dir_all(store.root().join(store.page_dir(id))).unwrap();
        let mut bytes = store
            .frame(&Header::Insert { index: 0 }, &[b"m", b"m"])
            .unwrap();
        bytes.extend(store.frame(&Header::Key, &[b"z"]).unwrap());
        fs::write(store.root().join(store.page_file(id, "0.5")), bytes).unwrap();

        assert!(matches!(store.read(id), Err(Error::CorruptPage { .. })));
    }

    #[test]
    fn test_branch_round_trip_and_checksum() {
        let (store, _dir) = create_test_store();
        let page = Page::branch(
            PageId::new(2),
            vec![
                Child::new(PageId::new(1), None),
                Child::new(PageId::new(3), Some(b"m".to_vec())),
            ],
        );
        let (name, bytes) = store.encode_branch(&page).unwrap();
        let dir = store.root().join(store.page_dir(page.id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(&name), &bytes).unwrap();

        let read = store.read(page.id()).unwrap();
        assert_eq!(read.children(), page.children());
        assert_eq!(read.file.as_deref(), Some(name.as_str()));

        let mut damaged = bytes.clone();
        damaged[10] ^= 0x01;
        fs::write(dir.join(&name), damaged).unwrap();
        assert!(matches!(store.read(page.id()), Err(Error::CorruptPage { .. })));
    }

    #[test]
    fn test_self_contained_leaf_encoding_keeps_ghost() {
        let (store, _dir) = create_test_store();
        let id = PageId::new(5);
        let mut page = Page::leaf(id);
        page.records_mut()
            .unwrap()
            .extend([Record::new("k", "1"), Record::new("l", "2")]);
        page.delete(0);
        page.right = Some(PageId::new(7));

        let dir = store.root().join(store.page_dir(id));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("0.9"), store.encode_leaf(&page).unwrap()).unwrap();

        let read = store.read(id).unwrap();
        assert_eq!(read.records(), page.records());
        assert_eq!(read.ghosts(), 1);
        assert_eq!(read.right(), Some(PageId::new(7)));
    }
}
