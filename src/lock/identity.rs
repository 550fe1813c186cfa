//! Identity Lock
//!
//! Owner-aware read/write lock embedded in every tree node for the
//! pessimistic scheme. Owners are transactions or threads, not guards, so a
//! lock taken in one invocation can be released by a later commit.
//!
//! # Rules
//!
//! - Any number of read owners, or exactly one write owner
//! - A write owner implicitly holds read
//! - Read -> write by the sole reader is an in-place upgrade
//! - Waits are bounded; expiry is reported to the caller, never panics

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{LockMode, LockOwner};

/// Outcome of a successful acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Newly acquired; the caller must release it exactly once
    Acquired,
    /// The owner already held a lock at least as strong
    AlreadyHeld,
    /// Read lock upgraded to write in place
    Upgraded,
}

impl Acquisition {
    /// True if a release ledger entry must be recorded
    pub fn needs_release(&self) -> bool {
        matches!(self, Acquisition::Acquired)
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<LockOwner>,
    writer: Option<LockOwner>,
}

impl LockState {
    fn holds(&self, owner: &LockOwner) -> bool {
        self.writer.as_ref() == Some(owner) || self.readers.contains(owner)
    }

    fn can_read(&self) -> bool {
        self.writer.is_none()
    }

    fn can_write(&self, owner: &LockOwner) -> bool {
        self.writer.is_none()
            && (self.readers.is_empty() || (self.readers.len() == 1 && self.readers.contains(owner)))
    }
}

/// Read/write/upgrade lock keyed by owner identity
#[derive(Debug, Default)]
pub struct IdentityLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl IdentityLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire in `mode` for `owner`, waiting at most `timeout`
    ///
    /// Returns `None` if the wait expired.
    pub fn acquire(
        &self,
        mode: LockMode,
        owner: &LockOwner,
        timeout: Duration,
    ) -> Option<Acquisition> {
        match mode {
            LockMode::Read => self.acquire_read(owner, timeout),
            LockMode::Write => self.acquire_write(owner, timeout),
        }
    }

    fn acquire_read(&self, owner: &LockOwner, timeout: Duration) -> Option<Acquisition> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.holds(owner) {
            return Some(Acquisition::AlreadyHeld);
        }
        while !state.can_read() {
            if self.released.wait_until(&mut state, deadline).timed_out() && !state.can_read() {
                return None;
            }
        }
        state.readers.insert(owner.clone());
        Some(Acquisition::Acquired)
    }

    fn acquire_write(&self, owner: &LockOwner, timeout: Duration) -> Option<Acquisition> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.writer.as_ref() == Some(owner) {
            return Some(Acquisition::AlreadyHeld);
        }
        while !state.can_write(owner) {
            if self.released.wait_until(&mut state, deadline).timed_out() && !state.can_write(owner)
            {
                return None;
            }
        }
        let upgraded = state.readers.remove(owner);
        state.writer = Some(owner.clone());
        Some(if upgraded {
            Acquisition::Upgraded
        } else {
            Acquisition::Acquired
        })
    }

    /// Release whatever `owner` holds; false if it held nothing
    pub fn release(&self, owner: &LockOwner) -> bool {
        let mut state = self.state.lock();
        let mut released = false;
        if state.writer.as_ref() == Some(owner) {
            state.writer = None;
            released = true;
        }
        released |= state.readers.remove(owner);
        drop(state);
        if released {
            self.released.notify_all();
        }
        released
    }

    /// Release every owner (used when a node is structurally destroyed)
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        state.readers.clear();
        state.writer = None;
        drop(state);
        self.released.notify_all();
    }

    /// True if any owner holds the lock
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || !state.readers.is_empty()
    }

    /// True if the lock is held in exactly `mode`
    pub fn is_locked_in(&self, mode: LockMode) -> bool {
        let state = self.state.lock();
        match mode {
            LockMode::Read => !state.readers.is_empty(),
            LockMode::Write => state.writer.is_some(),
        }
    }

    /// True if `owner` holds the lock in any mode
    pub fn is_owned_by(&self, owner: &LockOwner) -> bool {
        self.state.lock().holds(owner)
    }

    /// True if `owner` holds the lock at least in `mode`
    pub fn is_owned_by_in(&self, owner: &LockOwner, mode: LockMode) -> bool {
        let state = self.state.lock();
        match mode {
            LockMode::Read => state.holds(owner),
            LockMode::Write => state.writer.as_ref() == Some(owner),
        }
    }

    /// Current write owner
    pub fn writer(&self) -> Option<LockOwner> {
        self.state.lock().writer.clone()
    }

    /// Number of read owners
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
