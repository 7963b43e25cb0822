//! Per-page lock queue.
//!
//! Every cached page carries one [`PageLock`]. It is the only coordination
//! between descents: page content is never read or written without holding
//! the page's lock in the right mode.
//!
//! # Semantics
//! - Shared holders coexist; an exclusive holder excludes everybody.
//! - Requests that cannot be granted immediately wait in one FIFO queue.
//! - A shared request is queued whenever anything is already queued, so an
//!   exclusive request is never overtaken by shared requests that arrive
//!   after it (writer preference).
//! - When the lock becomes free, the head of the queue is granted: one
//!   exclusive request, or every consecutive shared request at the head.

use std::collections::{HashSet, VecDeque};

use parking_lot::{Condvar, Mutex};

/// Mode of a page lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
    queue: VecDeque<Waiter>,
    granted: HashSet<u64>,
    next_ticket: u64,
}

impl LockState {
    fn is_free(&self) -> bool {
        !self.exclusive && self.shared == 0
    }

    /// Grant the head of the queue if the lock is free. Returns true if
    /// anybody was granted.
    fn grant(&mut self) -> bool {
        if !self.is_free() {
            return false;
        }
        match self.queue.front().map(|waiter| waiter.mode) {
            Some(LockMode::Exclusive) => {
                if let Some(waiter) = self.queue.pop_front() {
                    self.exclusive = true;
                    self.granted.insert(waiter.ticket);
                }
                true
            }
            Some(LockMode::Shared) => {
                while let Some(waiter) = self.queue.front() {
                    if waiter.mode != LockMode::Shared {
                        break;
                    }
                    let ticket = waiter.ticket;
                    self.queue.pop_front();
                    self.shared += 1;
                    self.granted.insert(ticket);
                }
                true
            }
            None => false,
        }
    }
}

/// FIFO, writer-preferring shared/exclusive lock.
#[derive(Debug, Default)]
pub struct PageLock {
    state: Mutex<LockState>,
    granted: Condvar,
}

impl PageLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is held in `mode`.
    pub fn acquire(&self, mode: LockMode) {
        let mut state = self.state.lock();
        let immediate = state.queue.is_empty()
            && match mode {
                LockMode::Shared => !state.exclusive,
                LockMode::Exclusive => state.is_free(),
            };
        if immediate {
            match mode {
                LockMode::Shared => state.shared += 1,
                LockMode::Exclusive => state.exclusive = true,
            }
            return;
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(Waiter { ticket, mode });
        while !state.granted.remove(&ticket) {
            self.granted.wait(&mut state);
        }
    }

    /// Shared acquisition that ignores queued exclusive requests.
    ///
    /// Only the balancer's read-only branch descents use this. Branches are
    /// exclusively locked by the balancer alone, so a queued exclusive request
    /// on a branch can only be the balancer's own, and it is never waiting
    /// while a read-only descent runs.
    pub fn acquire_shared_reentrant(&self) {
        let mut state = self.state.lock();
        if !state.exclusive {
            state.shared += 1;
            return;
        }
        drop(state);
        self.acquire(LockMode::Shared);
    }

    /// Acquire without waiting. Returns false if the lock would block.
    pub fn try_acquire(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            return false;
        }
        match mode {
            LockMode::Shared if !state.exclusive => {
                state.shared += 1;
                true
            }
            LockMode::Exclusive if state.is_free() => {
                state.exclusive = true;
                true
            }
            _ => false,
        }
    }

    /// Release a hold previously acquired in `mode`.
    ///
    /// # Panics
    /// Panics if the lock is not held in `mode`, which indicates a bug.
    pub fn release(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Shared => {
                assert!(state.shared > 0, "shared release without a shared hold");
                state.shared -= 1;
            }
            LockMode::Exclusive => {
                assert!(state.exclusive, "exclusive release without an exclusive hold");
                state.exclusive = false;
            }
        }
        if state.grant() {
            self.granted.notify_all();
        }
    }

    /// True if anybody holds the lock.
    pub fn is_locked(&self) -> bool {
        !self.state.lock().is_free()
    }

    /// Number of queued requests.
    pub fn waiting(&self) -> usize {
        self.state.lock().queue.len()
    }
}
