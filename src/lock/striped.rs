//! Striped Lock Table
//!
//! Fixed-size table of owner-aware reentrant locks for the MVCC scheme.
//! A path maps to a stripe by its cached hash, so lock granularity is one
//! stripe rather than one node, and no lock object is ever allocated per
//! node.
//!
//! # Design
//!
//! - Power-of-2 stripe count enables fast modulo via bitwise AND
//! - Each stripe is cache-line aligned to prevent false sharing
//! - Reentrant per owner; `unlock` undoes exactly one acquisition level

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::LockOwner;
use crate::fqn::Fqn;

/// Default number of stripes
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 512;

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<LockOwner>,
    holds: u32,
}

/// Reentrant lock that remembers its owner
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct OwnableReentrantLock {
    state: Mutex<Ownership>,
    released: Condvar,
    /// Total successful acquisitions (statistics)
    acquisitions: AtomicU64,
}

impl OwnableReentrantLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire for `owner`, waiting at most `timeout`; false on expiry
    pub fn lock(&self, owner: &LockOwner, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match &state.owner {
                None => {
                    state.owner = Some(owner.clone());
                    state.holds = 1;
                    break;
                }
                Some(current) if current == owner => {
                    state.holds += 1;
                    break;
                }
                Some(_) => {
                    if self.released.wait_until(&mut state, deadline).timed_out()
                        && state.owner.is_some()
                        && state.owner.as_ref() != Some(owner)
                    {
                        return false;
                    }
                }
            }
        }
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Undo one acquisition level; false if `owner` does not hold the lock
    pub fn unlock(&self, owner: &LockOwner) -> bool {
        let mut state = self.state.lock();
        if state.owner.as_ref() != Some(owner) {
            return false;
        }
        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_all();
        }
        true
    }

    /// True if any owner holds the lock
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Current owner
    pub fn owner(&self) -> Option<LockOwner> {
        self.state.lock().owner.clone()
    }

    /// Reentrancy depth of the current owner
    pub fn hold_count(&self) -> u32 {
        self.state.lock().holds
    }

    /// Total successful acquisitions
    pub fn acquisition_count(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// Hash-striped table of [`OwnableReentrantLock`]s
pub struct StripedLockTable {
    stripes: Box<[OwnableReentrantLock]>,
    mask: usize,
}

impl StripedLockTable {
    /// Create a table with at least `concurrency_level` stripes
    ///
    /// The stripe count is rounded up to the next power of two.
    pub fn new(concurrency_level: usize) -> Self {
        let count = concurrency_level.max(1).next_power_of_two();
        let stripes: Vec<OwnableReentrantLock> =
            (0..count).map(|_| OwnableReentrantLock::new()).collect();
        Self {
            stripes: stripes.into_boxed_slice(),
            mask: count - 1,
        }
    }

    /// Number of stripes
    #[inline]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe index for `fqn`
    #[inline]
    pub fn stripe_index(&self, fqn: &Fqn) -> usize {
        // Spread high bits down so short paths don't cluster
        let h = fqn.cached_hash();
        ((h ^ (h >> 32) ^ (h >> 16)) as usize) & self.mask
    }

    /// Stripe guarding `fqn`
    #[inline]
    pub fn lock_for(&self, fqn: &Fqn) -> &OwnableReentrantLock {
        &self.stripes[self.stripe_index(fqn)]
    }

    /// Stripe by index
    #[inline]
    pub fn stripe(&self, index: usize) -> &OwnableReentrantLock {
        &self.stripes[index & self.mask]
    }

    /// Number of stripes currently held
    pub fn locked_count(&self) -> usize {
        self.stripes.iter().filter(|s| s.is_locked()).count()
    }

    /// Detailed statistics
    pub fn stats(&self) -> StripedLockStats {
        let hold_counts: Vec<u32> = self.stripes.iter().map(|s| s.hold_count()).collect();
        StripedLockStats {
            stripe_count: self.stripe_count(),
            locked_stripes: hold_counts.iter().filter(|&&h| h > 0).count(),
            total_holds: hold_counts.iter().map(|&h| h as u64).sum(),
            total_acquisitions: self.stripes.iter().map(|s| s.acquisition_count()).sum(),
        }
    }
}

impl Default for StripedLockTable {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY_LEVEL)
    }
}

impl std::fmt::Debug for StripedLockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedLockTable")
            .field("stripe_count", &self.stripe_count())
            .field("locked_count", &self.locked_count())
            .finish()
    }
}

/// Statistics for a striped lock table
#[derive(Debug, Clone)]
pub struct StripedLockStats {
    /// Number of stripes
    pub stripe_count: usize,
    /// Stripes currently held
    pub locked_stripes: usize,
    /// Sum of reentrancy depths across held stripes
    pub total_holds: u64,
    /// Successful acquisitions since creation
    pub total_acquisitions: u64,
}

// =============================================================================
// Tests
// =============================================================================
