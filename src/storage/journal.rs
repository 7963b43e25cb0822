//! Journaled commit of multi-file structural changes.
//!
//! A [`Commit`] collects file operations. New file content is staged under
//! `journal/staging/` as soon as it is added, so a commit's only large
//! writes happen before the commit point.
//!
//! # Protocol
//! 1. Stage new content (`journal/staging/<n>`).
//! 2. Write the operation list to `journal/pending`.
//! 3. Rename `journal/pending` to `journal/commit`. This is the commit point:
//!    a crash before it leaves the change undone, a crash after it leaves
//!    the change done.
//! 4. Apply the operations and remove `journal/commit`. Every operation is
//!    existence-checked, so replaying it during recovery is harmless.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::common::{Error, Result};

const JOURNAL: &str = "journal";
const STAGING: &str = "staging";
const PENDING: &str = "pending";
const COMMIT: &str = "commit";

/// A file operation, with paths relative to the tree directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    MakeDir { path: String },
    Emplace { staged: String, path: String },
    Unlink { path: String },
    RemoveDir { path: String },
}

/// What recovery found on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No interrupted commit.
    Clean,
    /// A commit was past its commit point and has been completed.
    Completed,
    /// A commit never reached its commit point and has been discarded.
    RolledBack,
}

fn sync_dir(path: &Path) -> io::Result<()> {
    fs::File::open(path)?.sync_all()
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Serializes commits for one tree directory.
pub struct Journal {
    root: PathBuf,
    sync: bool,
    next_stage: AtomicU64,
    active: Mutex<()>,
    /// Set when a commit's application failed past the commit point.
    unapplied: AtomicBool,
}

impl Journal {
    /// Open the journal of the tree at `root`, creating its directories.
    pub fn new(root: impl Into<PathBuf>, sync: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(JOURNAL).join(STAGING))?;
        Ok(Journal {
            root,
            sync,
            next_stage: AtomicU64::new(0),
            active: Mutex::new(()),
            unapplied: AtomicBool::new(false),
        })
    }

    fn dir(&self) -> PathBuf {
        self.root.join(JOURNAL)
    }

    /// Start a commit. Commits are serialized: this blocks while another
    /// commit is in flight.
    pub fn begin(&self) -> Commit<'_> {
        Commit {
            journal: self,
            _active: self.active.lock(),
            operations: Vec::new(),
        }
    }

    /// Finish or discard an interrupted commit.
    pub fn recover(&self) -> Result<Recovery> {
        let _active = self.active.lock();
        let dir = self.dir();
        let commit = dir.join(COMMIT);
        let pending = dir.join(PENDING);

        let recovery = if commit.exists() {
            let operations: Vec<Operation> = serde_json::from_slice(&fs::read(&commit)?)?;
            info!(
                target: "strata::journal",
                operations = operations.len(),
                "completing interrupted commit"
            );
            self.apply(&operations)?;
            fs::remove_file(&commit)?;
            Recovery::Completed
        } else if pending.exists() {
            info!(target: "strata::journal", "discarding uncommitted change");
            fs::remove_file(&pending)?;
            Recovery::RolledBack
        } else {
            Recovery::Clean
        };

        self.clear_staging()?;
        self.unapplied.store(false, Ordering::Release);
        Ok(recovery)
    }

    fn clear_staging(&self) -> Result<()> {
        let staging = self.dir().join(STAGING);
        ignore_missing(fs::remove_dir_all(&staging))?;
        fs::create_dir_all(&staging)?;
        Ok(())
    }

    fn apply(&self, operations: &[Operation]) -> Result<()> {
        for operation in operations {
            match operation {
                Operation::MakeDir { path } => fs::create_dir_all(self.root.join(path))?,
                Operation::Emplace { staged, path } => {
                    let staged = self.root.join(staged);
                    if staged.exists() {
                        let target = self.root.join(path);
                        if let Some(parent) = target.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::rename(&staged, &target)?;
                    }
                }
                Operation::Unlink { path } => {
                    ignore_missing(fs::remove_file(self.root.join(path)))?
                }
                Operation::RemoveDir { path } => {
                    ignore_missing(fs::remove_dir_all(self.root.join(path)))?
                }
            }
        }
        Ok(())
    }
}

/// An ordered set of file operations that applies as a unit.
pub struct Commit<'j> {
    journal: &'j Journal,
    _active: MutexGuard<'j, ()>,
    operations: Vec<Operation>,
}

impl Commit<'_> {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn make_dir(&mut self, path: impl Into<String>) {
        self.operations.push(Operation::MakeDir { path: path.into() });
    }

    /// Stage `bytes` now; they replace `path` when the commit applies.
    pub fn write(&mut self, path: impl Into<String>, bytes: &[u8]) -> Result<()> {
        let n = self.journal.next_stage.fetch_add(1, Ordering::Relaxed);
        let staged = format!("{JOURNAL}/{STAGING}/{n}");
        let mut file = fs::File::create(self.journal.root.join(&staged))?;
        file.write_all(bytes)?;
        if self.journal.sync {
            file.sync_all()?;
        }
        self.operations.push(Operation::Emplace {
            staged,
            path: path.into(),
        });
        Ok(())
    }

    pub fn unlink(&mut self, path: impl Into<String>) {
        self.operations.push(Operation::Unlink { path: path.into() });
    }

    pub fn remove_dir(&mut self, path: impl Into<String>) {
        self.operations.push(Operation::RemoveDir { path: path.into() });
    }

    /// Write the pending marker and stop short of the commit point.
    ///
    /// Exposed for recovery tests, which need a journal frozen before the
    /// atomic rename.
    pub fn prepare(self) -> Result<()> {
        self.write_pending()?;
        Ok(())
    }

    fn write_pending(&self) -> Result<PathBuf> {
        let dir = self.journal.dir();
        let pending = dir.join(PENDING);
        let mut file = fs::File::create(&pending)?;
        file.write_all(&serde_json::to_vec(&self.operations)?)?;
        if self.journal.sync {
            file.sync_all()?;
        }
        Ok(pending)
    }

    /// Make the change durable and apply it.
    ///
    /// # Errors
    /// `Error::Unapplied` if an earlier commit failed after its commit
    /// point. That commit's file stays in place for recovery, so no later
    /// commit may overwrite it.
    pub fn commit(self) -> Result<()> {
        if self.journal.unapplied.load(Ordering::Acquire) {
            return Err(Error::Unapplied);
        }
        if self.operations.is_empty() {
            return Ok(());
        }
        let dir = self.journal.dir();
        let pending = self.write_pending()?;
        let commit = dir.join(COMMIT);
        fs::rename(&pending, &commit)?;
        if self.journal.sync {
            sync_dir(&dir)?;
        }

        if let Err(err) = self
            .journal
            .apply(&self.operations)
            .and_then(|()| fs::remove_file(&commit).map_err(Error::from))
        {
            error!(
                target: "strata::journal",
                error = %err,
                "commit failed after its commit point"
            );
            self.journal.unapplied.store(true, Ordering::Release);
            return Err(err);
        }
        if self.journal.sync {
            ignore_missing(sync_dir(&self.journal.root.join("pages")))?;
        }
        debug!(
            target: "strata::journal",
            operations = self.operations.len(),
            "committed"
        );
        Ok(())
    }
}
