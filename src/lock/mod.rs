//! Lock Management
//!
//! Two interchangeable strategies share one contract:
//!
//! - [`PessimisticLockManager`] - owner-aware read/write/upgrade locks
//!   embedded in every tree node, acquired root-to-leaf
//! - [`MvccLockManager`] - hash-striped reentrant write locks keyed by path;
//!   reads take no lock at all
//!
//! The strategy is chosen once when the cache is built and stored as a
//! [`LockStrategy`]; every acquisition made on behalf of an invocation is
//! recorded as an [`AcquiredLock`] in a release ledger, so commit, rollback
//! and the end of a non-transactional call release exactly what was taken.

mod identity;
mod mvcc;
mod pessimistic;
mod striped;

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use identity::{Acquisition, IdentityLock};
pub use mvcc::MvccLockManager;
pub use pessimistic::{PathLockRequest, PessimisticLockManager};
pub use striped::{OwnableReentrantLock, StripedLockStats, StripedLockTable, DEFAULT_CONCURRENCY_LEVEL};

use crate::context::InvocationContext;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::transaction::GlobalTransaction;
use crate::tree::TreeNode;

// =============================================================================
// Modes & Owners
// =============================================================================

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "READ"),
            LockMode::Write => write!(f, "WRITE"),
        }
    }
}

/// Identity that owns a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockOwner {
    /// A local or remote transaction
    Transaction(GlobalTransaction),
    /// A thread running a non-transactional invocation
    Thread(u64),
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

impl LockOwner {
    /// Owner identity of the calling thread
    pub fn current_thread() -> LockOwner {
        let id = THREAD_ID.with(|cell| {
            if cell.get() == 0 {
                cell.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            cell.get()
        });
        LockOwner::Thread(id)
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, LockOwner::Transaction(_))
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(gtx) => write!(f, "{}", gtx),
            LockOwner::Thread(id) => write!(f, "Thread-{}", id),
        }
    }
}

// =============================================================================
// Release Ledger Entries
// =============================================================================

/// What an [`AcquiredLock`] points at
#[derive(Debug, Clone)]
pub enum LockHandle {
    /// Lock embedded in a node slot
    Node(Arc<TreeNode>),
    /// Stripe index in the striped table
    Stripe(usize),
}

/// One acquisition recorded in a release ledger
#[derive(Debug, Clone)]
pub struct AcquiredLock {
    pub fqn: Fqn,
    pub mode: LockMode,
    pub handle: LockHandle,
}

impl AcquiredLock {
    pub fn node(node: Arc<TreeNode>, mode: LockMode) -> Self {
        Self {
            fqn: node.fqn().clone(),
            mode,
            handle: LockHandle::Node(node),
        }
    }

    pub fn stripe(fqn: Fqn, index: usize) -> Self {
        Self {
            fqn,
            mode: LockMode::Write,
            handle: LockHandle::Stripe(index),
        }
    }
}

// =============================================================================
// Contract
// =============================================================================

/// Acquire/release/query contract shared by both strategies
pub trait LockManager: Send + Sync {
    /// Acquire `mode` on `fqn` for `owner`
    ///
    /// `Ok(true)` means a new acquisition was made and must be released;
    /// `Ok(false)` means nothing new was taken (already held, or nothing to
    /// lock). Expiry of `timeout` is a [`crate::Error::LockTimeout`].
    fn lock(&self, fqn: &Fqn, mode: LockMode, owner: &LockOwner, timeout: Duration) -> Result<bool>;

    /// Undo one acquisition by `owner`
    ///
    /// Releasing a lock the owner does not hold is
    /// [`crate::Error::IllegalLockRelease`].
    fn unlock(&self, fqn: &Fqn, owner: &LockOwner) -> Result<()>;

    /// Release one ledger entry
    fn release(&self, lock: &AcquiredLock, owner: &LockOwner) -> Result<()>;

    fn is_locked(&self, fqn: &Fqn) -> bool;

    fn is_locked_in(&self, fqn: &Fqn, mode: LockMode) -> bool;

    fn owns_lock(&self, fqn: &Fqn, owner: &LockOwner) -> bool;

    /// Acquire on behalf of the invocation and record it in the context's
    /// release ledger in one step
    fn lock_and_record(&self, fqn: &Fqn, mode: LockMode, ctx: &mut InvocationContext) -> Result<bool>;

    /// Number of locks currently held by anyone
    fn number_of_locks_held(&self) -> usize;

    /// Release every entry of a ledger, newest first
    ///
    /// Every entry is attempted; the first failure is returned.
    fn release_all(&self, locks: Vec<AcquiredLock>, owner: &LockOwner) -> Result<()> {
        let mut first_error = None;
        for lock in locks.iter().rev() {
            if let Err(e) = self.release(lock, owner) {
                tracing::error!(fqn = %lock.fqn, owner = %owner, error = %e, "lock ledger release failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// =============================================================================
// Static Dispatch
// =============================================================================

/// Lock strategy selected once at build time
#[derive(Debug, Clone)]
pub enum LockStrategy {
    Pessimistic(PessimisticLockManager),
    Mvcc(MvccLockManager),
}

impl LockStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LockStrategy::Pessimistic(_) => "pessimistic",
            LockStrategy::Mvcc(_) => "mvcc",
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $m:ident => $e:expr) => {
        match $self {
            LockStrategy::Pessimistic($m) => $e,
            LockStrategy::Mvcc($m) => $e,
        }
    };
}

impl LockManager for LockStrategy {
    fn lock(&self, fqn: &Fqn, mode: LockMode, owner: &LockOwner, timeout: Duration) -> Result<bool> {
        dispatch!(self, m => m.lock(fqn, mode, owner, timeout))
    }

    fn unlock(&self, fqn: &Fqn, owner: &LockOwner) -> Result<()> {
        dispatch!(self, m => m.unlock(fqn, owner))
    }

    fn release(&self, lock: &AcquiredLock, owner: &LockOwner) -> Result<()> {
        dispatch!(self, m => m.release(lock, owner))
    }

    fn is_locked(&self, fqn: &Fqn) -> bool {
        dispatch!(self, m => m.is_locked(fqn))
    }

    fn is_locked_in(&self, fqn: &Fqn, mode: LockMode) -> bool {
        dispatch!(self, m => m.is_locked_in(fqn, mode))
    }

    fn owns_lock(&self, fqn: &Fqn, owner: &LockOwner) -> bool {
        dispatch!(self, m => m.owns_lock(fqn, owner))
    }

    fn lock_and_record(&self, fqn: &Fqn, mode: LockMode, ctx: &mut InvocationContext) -> Result<bool> {
        dispatch!(self, m => m.lock_and_record(fqn, mode, ctx))
    }

    fn number_of_locks_held(&self) -> usize {
        dispatch!(self, m => m.number_of_locks_held())
    }
}

// =============================================================================
// Tests
// =============================================================================
