//! Integration tests for the tree.
//!
//! These tests drive the public API end to end: cursor traversal after
//! balancing, reopen round trips, and cursors racing the balancer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use strata::{Error, Order, Tree};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

/// Print the tree's events when `RUST_LOG` asks for them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn create_tree(dir: &Path, split: usize) -> Tree {
    Tree::builder()
        .directory(dir.join("tree"))
        .leaf(Order::new(split, 1))
        .branch(Order::new(split, 1))
        .sync(false)
        .balance_interval(None)
        .create()
        .unwrap()
}

fn open_tree(dir: &Path, split: usize) -> Tree {
    Tree::builder()
        .directory(dir.join("tree"))
        .leaf(Order::new(split, 1))
        .branch(Order::new(split, 1))
        .sync(false)
        .balance_interval(None)
        .open()
        .unwrap()
}

fn keys(tree: &Tree) -> Vec<String> {
    tree.iter()
        .map(|record| String::from_utf8(record.unwrap().key).unwrap())
        .collect()
}

fn alphabet() -> Vec<String> {
    (b'a'..=b'z').map(|c| (c as char).to_string()).collect()
}

/// Deterministic pseudo-random numbers for the writer threads.
fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

/// Walk every leaf with one cursor, checking that keys only ascend.
fn walk_ascending(tree: &Tree) -> usize {
    let mut cursor = tree.first().unwrap();
    let mut last: Option<Vec<u8>> = None;
    let mut seen = 0;
    loop {
        for index in cursor.offset()..cursor.count() {
            let key = cursor.get(index).unwrap().key;
            if let Some(last) = &last {
                assert!(last < &key, "{last:?} before {key:?}");
            }
            last = Some(key);
            seen += 1;
        }
        if !cursor.advance().unwrap() {
            return seen;
        }
    }
}

#[test]
fn test_alphabet_grows_tree() {
    init_tracing();
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    for key in alphabet() {
        tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
    }
    tree.drain().unwrap();

    assert_eq!(keys(&tree), alphabet());
    assert!(tree.height().unwrap() > 1);
    let report = tree.verify().unwrap();
    assert_eq!(report.records, 26);
    assert!(report.height > 1);
    tree.close().unwrap();
}

#[test]
fn test_delete_merges_right_leaf_into_left() {
    init_tracing();
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    for key in ["a", "b", "c", "d", "e"] {
        tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
    }
    tree.drain().unwrap();
    assert_eq!(tree.verify().unwrap().leaves, 2);

    assert_eq!(tree.remove(b"e").unwrap().as_deref(), Some(&b"e"[..]));
    tree.drain().unwrap();

    let report = tree.verify().unwrap();
    assert_eq!(report.leaves, 1);
    let from_a: Vec<String> = tree
        .range_from(b"a")
        .map(|record| String::from_utf8(record.unwrap().key).unwrap())
        .collect();
    assert_eq!(from_a, vec!["a", "b", "c", "d"]);
}

#[test]
fn test_insert_replaces_and_get_reads_back() {
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    for key in alphabet() {
        tree.insert(key.as_bytes(), b"1").unwrap();
    }
    tree.drain().unwrap();

    // Replacing a leading record keeps it as the leaf's routing key.
    for key in alphabet() {
        let previous = tree.insert(key.as_bytes(), b"2").unwrap();
        assert_eq!(previous.as_deref(), Some(&b"1"[..]));
    }
    tree.drain().unwrap();

    for key in alphabet() {
        assert_eq!(tree.get(key.as_bytes()).unwrap().as_deref(), Some(&b"2"[..]));
    }
    assert_eq!(tree.get(b"zz").unwrap(), None);
    assert_eq!(keys(&tree), alphabet());
    tree.verify().unwrap();
}

#[test]
fn test_cursor_walks_leaves() {
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    for key in alphabet() {
        tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
    }
    tree.drain().unwrap();

    let mut cursor = tree.search(b"c").unwrap();
    assert!(cursor.found());
    let mut seen = Vec::new();
    let mut index = cursor.index();
    loop {
        while index < cursor.count() {
            seen.push(cursor.get(index).unwrap().key);
            index += 1;
        }
        if !cursor.advance().unwrap() {
            break;
        }
        index = cursor.offset();
    }
    assert_eq!(seen.len(), 24);
    assert_eq!(seen.first().map(Vec::as_slice), Some(&b"c"[..]));
    assert_eq!(seen.last().map(Vec::as_slice), Some(&b"z"[..]));
}

#[test]
fn test_mutator_insert_at_position() {
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    tree.insert(b"a", b"a").unwrap();
    tree.insert(b"c", b"c").unwrap();

    let mut mutator = tree.search_mut(b"b").unwrap();
    let index = mutator.index_of(b"b").unwrap().unwrap_err();
    assert_eq!(index, 1);
    assert!(mutator.insert(index, b"b", b"b").unwrap());
    assert!(matches!(
        mutator.insert(9, b"x", b"x"),
        Err(Error::IndexOutOfRange { index: 9, .. })
    ));
    drop(mutator);

    assert_eq!(keys(&tree), vec!["a", "b", "c"]);
}

#[test]
fn test_reopen_round_trip() {
    let dir = tempdir().unwrap();
    let expected: Vec<String> = (0..200).map(|i| format!("{i:04}")).collect();
    {
        let tree = create_tree(dir.path(), 6);
        for key in &expected {
            tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
        }
        for key in expected.iter().step_by(3) {
            tree.remove(key.as_bytes()).unwrap();
        }
        tree.drain().unwrap();
        tree.close().unwrap();
    }

    let remaining: Vec<String> = expected
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 != 0)
        .map(|(_, key)| key.clone())
        .collect();
    let tree = open_tree(dir.path(), 6);
    assert_eq!(keys(&tree), remaining);
    let report = tree.verify().unwrap();
    assert_eq!(report.records, remaining.len());

    // The reopened tree keeps working.
    tree.insert(b"9999", b"last").unwrap();
    tree.drain().unwrap();
    assert_eq!(tree.get(b"9999").unwrap().as_deref(), Some(&b"last"[..]));
}

#[test]
fn test_closed_tree_rejects_operations() {
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    tree.close().unwrap();
    assert!(matches!(tree.search(b"a"), Err(Error::Closed)));
    assert!(matches!(tree.insert(b"a", b"a"), Err(Error::Closed)));
    assert!(matches!(tree.drain(), Err(Error::Closed)));
}

#[test]
fn test_create_refuses_existing_tree() {
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    tree.close().unwrap();
    let result = Tree::builder()
        .directory(dir.path().join("tree"))
        .balance_interval(None)
        .create();
    assert!(matches!(result, Err(Error::DirectoryNotEmpty(_))));
}

#[test]
fn test_background_balancer_with_concurrent_cursors() {
    init_tracing();
    let dir = tempdir().unwrap();
    let tree = Tree::builder()
        .directory(dir.path().join("tree"))
        .leaf(Order::new(5, 1))
        .branch(Order::new(5, 1))
        .sync(false)
        .balance_interval(Some(Duration::from_millis(1)))
        .create()
        .unwrap();
    let all: Vec<String> = (0..300).map(|i| format!("{i:04}")).collect();

    thread::scope(|scope| {
        scope.spawn(|| {
            for key in &all {
                tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
            }
        });
        scope.spawn(|| {
            for _ in 0..20 {
                let seen: Vec<Vec<u8>> = tree.iter().map(|record| record.unwrap().key).collect();
                assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
                assert!(seen.iter().all(|key| key.len() == 4));
            }
        });
    });

    tree.drain().unwrap();
    assert_eq!(keys(&tree), all);
    tree.verify().unwrap();
    tree.close().unwrap();
}

#[test]
fn test_concurrent_writers_leave_valid_tree() {
    init_tracing();
    let dir = tempdir().unwrap();
    let tree = Tree::builder()
        .directory(dir.path().join("tree"))
        .leaf(Order::new(4, 1))
        .branch(Order::new(4, 1))
        .sync(false)
        .balance_interval(Some(Duration::from_millis(1)))
        .create()
        .unwrap();

    let models: Vec<BTreeSet<String>> = thread::scope(|scope| {
        let walkers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    for _ in 0..10 {
                        walk_ascending(&tree);
                    }
                })
            })
            .collect();
        let writers: Vec<_> = (0..4u64)
            .map(|writer| {
                let tree = &tree;
                scope.spawn(move || {
                    let mut state = 0x9E37_79B9_7F4A_7C15 ^ (writer + 1);
                    let mut model = BTreeSet::new();
                    for _ in 0..600 {
                        let n = xorshift(&mut state);
                        let key = format!("{:03}-{writer}", n % 150);
                        if n % 3 == 0 {
                            tree.remove(key.as_bytes()).unwrap();
                            model.remove(&key);
                        } else {
                            tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
                            model.insert(key);
                        }
                    }
                    model
                })
            })
            .collect();
        for walker in walkers {
            walker.join().unwrap();
        }
        writers
            .into_iter()
            .map(|writer| writer.join().unwrap())
            .collect()
    });

    tree.drain().unwrap();
    let report = tree.verify().unwrap();
    let expected: Vec<String> = models.into_iter().flatten().collect::<BTreeSet<_>>().into_iter().collect();
    assert_eq!(report.records, expected.len());
    assert_eq!(keys(&tree), expected);
    assert_eq!(walk_ascending(&tree), expected.len());
    tree.close().unwrap();
}

#[test]
fn test_cursor_advances_across_concurrent_split() {
    let dir = tempdir().unwrap();
    let tree = create_tree(dir.path(), 5);
    for key in ["a", "b", "c", "m", "n"] {
        tree.insert(key.as_bytes(), key.as_bytes()).unwrap();
    }
    tree.drain().unwrap();
    tree.insert(b"o", b"o").unwrap();
    tree.insert(b"p", b"p").unwrap();
    assert_eq!(tree.verify().unwrap().leaves, 2);

    // A reader parked on the left leaf does not stop a writer and the
    // balancer from filling and splitting its right sibling.
    let mut cursor = tree.search(b"a").unwrap();
    let left = cursor.page_id();
    thread::scope(|scope| {
        scope
            .spawn(|| {
                tree.insert(b"q", b"q").unwrap();
                tree.balance().unwrap();
            })
            .join()
            .unwrap();
    });
    assert_eq!(tree.verify().unwrap().leaves, 3);

    let mut seen = Vec::new();
    loop {
        for index in cursor.offset()..cursor.count() {
            seen.push(String::from_utf8(cursor.get(index).unwrap().key).unwrap());
        }
        if !cursor.advance().unwrap() {
            break;
        }
    }
    assert_eq!(seen, vec!["a", "b", "c", "m", "n", "o", "p", "q"]);
    drop(cursor);

    // A writer on the leaf a reader holds waits for the reader to move on.
    let mut cursor = tree.search(b"a").unwrap();
    assert_eq!(cursor.page_id(), left);
    assert!(cursor.advance().unwrap());
    let held = cursor.page_id();
    let count = cursor.count();
    thread::scope(|scope| {
        let writer = scope.spawn(|| tree.insert(b"mm", b"mm").unwrap());
        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());
        assert_eq!(cursor.count(), count);
        drop(cursor);
        assert_eq!(writer.join().unwrap(), None);
    });
    let cursor = tree.search(b"mm").unwrap();
    assert_eq!(cursor.page_id(), held);
    assert!(cursor.found());
    drop(cursor);

    tree.drain().unwrap();
    let report = tree.verify().unwrap();
    assert_eq!(report.records, 9);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_traversal_matches_model(
        ops in proptest::collection::vec((any::<bool>(), 0u8..48, any::<bool>()), 1..160)
    ) {
        let dir = tempdir().unwrap();
        let tree = create_tree(dir.path(), 4);
        let mut model = BTreeMap::new();
        for (insert, key, drain) in ops {
            let key = format!("{key:02}");
            if insert {
                tree.insert(key.as_bytes(), b"v").unwrap();
                model.insert(key, ());
            } else {
                tree.remove(key.as_bytes()).unwrap();
                model.remove(&key);
            }
            if drain {
                tree.drain().unwrap();
            }
        }
        tree.drain().unwrap();

        let expected: Vec<String> = model.into_keys().collect();
        prop_assert_eq!(keys(&tree), expected.clone());
        let report = tree.verify().unwrap();
        prop_assert_eq!(report.records, expected.len());
    }
}
