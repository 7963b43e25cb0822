//! Common types and utilities shared across Strata.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration (thresholds, comparator, checksum)
//! - Error types
//! - Page identifiers

pub mod config;
pub mod error;
mod page_id;

pub use config::{Checksum, Comparator, Extractor, Options, Order};
pub use error::{Error, Result};
pub use page_id::PageId;
