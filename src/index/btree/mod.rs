//! B+tree over append-only leaves.
//!
//! - [`Tree`] / [`Builder`] - create, open and close a tree; record operations
//! - [`Cursor`] / [`Mutator`] - positioned access to one leaf
//! - [`Iter`] - key-ordered scans across leaves
//! - `balancer` - splits and merges, run in the background or on demand
//! - `vacuum` - leaf compaction and segment garbage collection

mod balancer;
mod cursor;
mod descent;
mod tree;
mod vacuum;
mod verify;

pub use cursor::{Cursor, Iter, Mutator};
pub use tree::{Builder, Tree};
pub use verify::Report;
