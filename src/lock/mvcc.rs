//! MVCC Lock Manager
//!
//! Write locks only, taken on the stripe a path hashes to. Readers never
//! block; writers of the same stripe are serialized. Each transaction
//! records a stripe at most once in its ledger, so commit releases every
//! stripe exactly once.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::{AcquiredLock, LockHandle, LockManager, LockMode, LockOwner, StripedLockTable};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::fqn::Fqn;

/// Striped ownership locking
#[derive(Debug, Clone)]
pub struct MvccLockManager {
    table: Arc<StripedLockTable>,
}

impl MvccLockManager {
    /// Manager over a table of at least `concurrency_level` stripes
    pub fn new(concurrency_level: usize) -> Self {
        Self {
            table: Arc::new(StripedLockTable::new(concurrency_level)),
        }
    }

    pub fn table(&self) -> &StripedLockTable {
        &self.table
    }

    fn timeout_error(fqn: &Fqn, owner: &LockOwner, timeout: Duration) -> Error {
        Error::LockTimeout {
            fqn: fqn.clone(),
            owner: owner.to_string(),
            mode: LockMode::Write.to_string(),
            timeout,
        }
    }
}

impl LockManager for MvccLockManager {
    fn lock(&self, fqn: &Fqn, mode: LockMode, owner: &LockOwner, timeout: Duration) -> Result<bool> {
        if mode == LockMode::Read {
            return Ok(false);
        }
        if self.table.lock_for(fqn).lock(owner, timeout) {
            trace!(fqn = %fqn, owner = %owner, "stripe acquired");
            Ok(true)
        } else {
            Err(Self::timeout_error(fqn, owner, timeout))
        }
    }

    fn unlock(&self, fqn: &Fqn, owner: &LockOwner) -> Result<()> {
        if self.table.lock_for(fqn).unlock(owner) {
            trace!(fqn = %fqn, owner = %owner, "stripe released");
            Ok(())
        } else {
            Err(Error::IllegalLockRelease {
                fqn: fqn.clone(),
                owner: owner.to_string(),
            })
        }
    }

    fn release(&self, lock: &AcquiredLock, owner: &LockOwner) -> Result<()> {
        match lock.handle {
            LockHandle::Stripe(index) => {
                if self.table.stripe(index).unlock(owner) {
                    trace!(fqn = %lock.fqn, owner = %owner, stripe = index, "stripe released");
                    Ok(())
                } else {
                    Err(Error::IllegalLockRelease {
                        fqn: lock.fqn.clone(),
                        owner: owner.to_string(),
                    })
                }
            }
            LockHandle::Node(_) => Err(Error::InvalidState(format!(
                "node lock entry for {} in an MVCC ledger",
                lock.fqn
            ))),
        }
    }

    fn is_locked(&self, fqn: &Fqn) -> bool {
        self.table.lock_for(fqn).is_locked()
    }

    fn is_locked_in(&self, fqn: &Fqn, mode: LockMode) -> bool {
        mode == LockMode::Write && self.is_locked(fqn)
    }

    fn owns_lock(&self, fqn: &Fqn, owner: &LockOwner) -> bool {
        self.table.lock_for(fqn).owner().as_ref() == Some(owner)
    }

    fn lock_and_record(&self, fqn: &Fqn, mode: LockMode, ctx: &mut InvocationContext) -> Result<bool> {
        if mode == LockMode::Read {
            return Ok(false);
        }
        let owner = ctx.lock_owner();
        if self.owns_lock(fqn, &owner) {
            return Ok(false);
        }
        let timeout = ctx.lock_timeout();
        if !self.table.lock_for(fqn).lock(&owner, timeout) {
            return Err(Self::timeout_error(fqn, &owner, timeout));
        }
        trace!(fqn = %fqn, owner = %owner, "stripe acquired");
        ctx.record_lock(AcquiredLock::stripe(fqn.clone(), self.table.stripe_index(fqn)));
        Ok(true)
    }

    fn number_of_locks_held(&self) -> usize {
        self.table.locked_count()
    }
}

// =============================================================================
// Tests
// =============================================================================
