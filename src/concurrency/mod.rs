//! Concurrency primitives.
//!
//! - [`PageLock`] - FIFO, writer-preferring shared/exclusive lock embedded in
//!   every cached page

mod page_lock;

pub use page_lock::{LockMode, PageLock};
