//! Strata - an embedded, concurrent, persistent B+tree.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                              Tree                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │              Index Layer (index/btree/)                  │   │
//! │  │    Cursor / Mutator → Descent    Balancer → Vacuum       │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │       Page Cache (buffer/) + Page Locks (concurrency/)   │   │
//! │  │      one entry per page, heft budget, balancer refs      │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │           Storage Layer (storage/)                       │   │
//! │  │   PageStore (leaf segments, branch files) + Journal      │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Leaves are append-only logs of insert and delete records. Branches are
//! small files rewritten whole. Every change that touches more than one
//! page goes through a journaled commit, so a crash leaves either the old
//! tree or the new one.
//!
//! # Modules
//! - [`common`] - Page ids, errors, options
//! - [`concurrency`] - The per-page lock queue
//! - [`storage`] - Page files, log records and the journal
//! - [`buffer`] - The page cache
//! - [`index`] - The B+tree
//!
//! # Quick Start
//! ```no_run
//! use strata::{Options, Tree};
//!
//! let tree = Tree::create("/tmp/strata-quick-start", Options::default()).unwrap();
//! tree.insert(b"apple", b"red").unwrap();
//! tree.insert(b"banana", b"yellow").unwrap();
//! for record in tree.iter() {
//!     let record = record.unwrap();
//!     println!("{:?} => {:?}", record.key, record.value);
//! }
//! tree.close().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod index;
pub mod storage;

pub use buffer::{CacheStats, StatsSnapshot};
pub use common::{Checksum, Error, Options, Order, PageId, Result};
pub use index::btree::{Builder, Cursor, Iter, Mutator, Report, Tree};
pub use storage::page::Record;
