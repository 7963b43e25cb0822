//! Error types for Strata.

use std::path::PathBuf;

use thiserror::Error;

use crate::common::PageId;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in Strata.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from page files, segments or the journal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A log record header could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A page failed its checksum or a structural check while loading.
    ///
    /// Fatal. Loads are never silently retried.
    #[error("corrupt page {id}: {reason}")]
    CorruptPage { id: PageId, reason: String },

    /// A mandatory construction option was not supplied.
    #[error("option required: {0}")]
    OptionRequired(&'static str),

    /// Construction options are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `create` was pointed at a directory that already holds files.
    #[error("directory {} is not empty", .0.display())]
    DirectoryNotEmpty(PathBuf),

    /// A cursor operation addressed a slot outside the page's live range.
    #[error("index {index} out of range for page of {len} items")]
    IndexOutOfRange { index: usize, len: usize },

    /// A page changed under an operation that planned against it.
    ///
    /// Internal and recoverable: descents restart and the balancer
    /// re-queues. Never returned from the public API.
    #[error("page {0} changed during the operation")]
    RaceInvalidated(PageId),

    /// A commit passed its commit point but could not be applied.
    ///
    /// The journal refuses further commits until the tree is reopened,
    /// which completes the commit.
    #[error("an earlier commit was not applied; reopen the tree to recover")]
    Unapplied,

    /// The tree was closed.
    #[error("tree is closed")]
    Closed,
}

impl Error {
    pub(crate) fn corrupt(id: PageId, reason: impl Into<String>) -> Self {
        Error::CorruptPage {
            id,
            reason: reason.into(),
        }
    }
}
