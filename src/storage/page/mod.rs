//! Page types and on-disk record framing.
//!
//! This module contains:
//! - [`Page`] - The in-memory form of a leaf or branch
//! - [`Items`], [`Record`], [`Child`] - Page contents
//! - [`log_record`] - Checksummed, length-framed records with JSON headers

#[allow(clippy::module_inception)]
mod page;
pub mod log_record;

pub use log_record::{BranchEntry, Header};
pub use page::{Child, Items, Page, Record, Summary};
