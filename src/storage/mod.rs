//! Storage layer - page files, log records and the commit journal.
//!
//! This module handles persistent storage:
//! - [`PageStore`] - Page file layout, leaf replay and appends
//! - [`page`] - Page types and log record framing
//! - [`Journal`] - Atomic multi-file commits with crash recovery
//! - [`Segment`] - Leaf segment names

pub mod journal;
pub mod page;
mod page_store;
pub mod segment;

pub use journal::{Commit, Journal, Recovery};
pub use page_store::{PageStore, SegmentRefs};
pub use segment::Segment;
