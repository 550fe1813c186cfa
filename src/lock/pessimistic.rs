//! Pessimistic Lock Manager
//!
//! Locks live in the node slots. A path is always locked root-to-leaf:
//! read locks on the strict ancestors, the requested mode on the target,
//! optionally a write lock on the parent when the target is structurally
//! inserted or removed, and write locks on every descendant for removal.
//! Every caller follows this order, so two owners needing a path and one
//! of its ancestors cannot deadlock.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::{Acquisition, AcquiredLock, LockHandle, LockManager, LockMode, LockOwner};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::fqn::Fqn;
use crate::tree::{DataContainer, TreeNode};

/// How [`PessimisticLockManager::acquire_path`] locks a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathLockRequest {
    /// Mode taken on the target
    pub mode: LockMode,
    /// Create missing nodes along the way (recorded in the tx ledger)
    pub create_if_missing: bool,
    /// Write-lock the parent of the target
    pub lock_parent: bool,
    /// Write-lock every descendant of the target
    pub include_descendants: bool,
    /// Release at the end of the invocation even inside a transaction
    pub invocation_scope: bool,
}

impl PathLockRequest {
    pub fn read() -> Self {
        Self {
            mode: LockMode::Read,
            create_if_missing: false,
            lock_parent: false,
            include_descendants: false,
            invocation_scope: false,
        }
    }

    pub fn write() -> Self {
        Self {
            mode: LockMode::Write,
            ..Self::read()
        }
    }

    pub fn creating(mut self) -> Self {
        self.create_if_missing = true;
        self
    }

    pub fn with_parent(mut self, lock_parent: bool) -> Self {
        self.lock_parent = lock_parent;
        self
    }

    pub fn with_descendants(mut self) -> Self {
        self.include_descendants = true;
        self
    }

    pub fn invocation_scoped(mut self) -> Self {
        self.invocation_scope = true;
        self
    }
}

/// Node-attached read/write/upgrade locking
#[derive(Debug, Clone)]
pub struct PessimisticLockManager {
    container: Arc<DataContainer>,
}

impl PessimisticLockManager {
    pub fn new(container: Arc<DataContainer>) -> Self {
        Self { container }
    }

    pub fn container(&self) -> &Arc<DataContainer> {
        &self.container
    }

    /// Acquire `mode` on a single node slot
    pub fn lock_node(
        &self,
        node: &TreeNode,
        mode: LockMode,
        owner: &LockOwner,
        timeout: Duration,
    ) -> Result<Acquisition> {
        match node.lock().acquire(mode, owner, timeout) {
            Some(acquisition) => {
                trace!(fqn = %node.fqn(), owner = %owner, mode = %mode, ?acquisition, "lock acquired");
                Ok(acquisition)
            }
            None => Err(Error::LockTimeout {
                fqn: node.fqn().clone(),
                owner: owner.to_string(),
                mode: mode.to_string(),
                timeout,
            }),
        }
    }

    /// Lock `fqn` and its ancestors for the invocation in `ctx`
    ///
    /// Nodes found invalid after their lock was granted were removed while
    /// we waited; the walk restarts from the root.
    pub fn acquire_path(&self, fqn: &Fqn, request: PathLockRequest, ctx: &mut InvocationContext) -> Result<()> {
        let owner = ctx.lock_owner();
        let timeout = ctx.lock_timeout();
        let depth = fqn.size();

        'walk: loop {
            for (generation, current) in fqn.lineage().into_iter().enumerate() {
                let node = match self.container.peek(&current, false, true) {
                    Some(node) => node,
                    // Created one step ahead of its lock. If a concurrent
                    // creator wins the lock and we time out, outside a
                    // transaction the node stays behind as an empty
                    // placeholder: a legal tree state that eviction reclaims.
                    None if request.create_if_missing => {
                        let result = self.container.create_nodes(&current);
                        if let Some(tx) = ctx.tx_context() {
                            tx.lock().created.extend(result.created);
                        }
                        result.target
                    }
                    None => return Ok(()),
                };

                let mode = if generation == depth {
                    request.mode
                } else if request.lock_parent && generation + 1 == depth {
                    LockMode::Write
                } else {
                    LockMode::Read
                };

                if !self.acquire_valid(&node, mode, &owner, timeout, request.invocation_scope, ctx)? {
                    trace!(fqn = %current, "node removed while waiting, restarting walk");
                    continue 'walk;
                }
            }
            break;
        }

        if request.include_descendants {
            for node in self.container.subtree(fqn).into_iter().skip(1) {
                self.acquire_valid(&node, LockMode::Write, &owner, timeout, false, ctx)?;
            }
        }
        Ok(())
    }

    /// Acquire, verify the node is still live, then record
    fn acquire_valid(
        &self,
        node: &Arc<TreeNode>,
        mode: LockMode,
        owner: &LockOwner,
        timeout: Duration,
        invocation_scope: bool,
        ctx: &mut InvocationContext,
    ) -> Result<bool> {
        let acquisition = self.lock_node(node, mode, owner, timeout)?;
        if !node.is_valid() {
            if acquisition.needs_release() {
                node.lock().release(owner);
            }
            return Ok(false);
        }
        match acquisition {
            Acquisition::Acquired => {
                let entry = AcquiredLock::node(Arc::clone(node), mode);
                if invocation_scope {
                    ctx.record_invocation_lock(entry);
                } else {
                    ctx.record_lock(entry);
                }
            }
            Acquisition::Upgraded => ctx.promote_lock(node.fqn()),
            Acquisition::AlreadyHeld => {}
        }
        Ok(true)
    }
}

impl LockManager for PessimisticLockManager {
    fn lock(&self, fqn: &Fqn, mode: LockMode, owner: &LockOwner, timeout: Duration) -> Result<bool> {
        match self.container.peek(fqn, false, true) {
            Some(node) => Ok(self.lock_node(&node, mode, owner, timeout)?.needs_release()),
            None => Ok(false),
        }
    }

    fn unlock(&self, fqn: &Fqn, owner: &LockOwner) -> Result<()> {
        let released = self
            .container
            .peek(fqn, true, true)
            .map(|node| node.lock().release(owner))
            .unwrap_or(false);
        if released {
            trace!(fqn = %fqn, owner = %owner, "lock released");
            Ok(())
        } else {
            Err(Error::IllegalLockRelease {
                fqn: fqn.clone(),
                owner: owner.to_string(),
            })
        }
    }

    fn release(&self, lock: &AcquiredLock, owner: &LockOwner) -> Result<()> {
        match &lock.handle {
            LockHandle::Node(node) => {
                if node.lock().release(owner) {
                    trace!(fqn = %lock.fqn, owner = %owner, "lock released");
                    Ok(())
                } else {
                    Err(Error::IllegalLockRelease {
                        fqn: lock.fqn.clone(),
                        owner: owner.to_string(),
                    })
                }
            }
            LockHandle::Stripe(_) => Err(Error::InvalidState(format!(
                "striped lock entry for {} in a pessimistic ledger",
                lock.fqn
            ))),
        }
    }

    fn is_locked(&self, fqn: &Fqn) -> bool {
        self.container
            .peek(fqn, true, true)
            .map(|node| node.lock().is_locked())
            .unwrap_or(false)
    }

    fn is_locked_in(&self, fqn: &Fqn, mode: LockMode) -> bool {
        self.container
            .peek(fqn, true, true)
            .map(|node| node.lock().is_locked_in(mode))
            .unwrap_or(false)
    }

    fn owns_lock(&self, fqn: &Fqn, owner: &LockOwner) -> bool {
        self.container
            .peek(fqn, true, true)
            .map(|node| node.lock().is_owned_by(owner))
            .unwrap_or(false)
    }

    fn lock_and_record(&self, fqn: &Fqn, mode: LockMode, ctx: &mut InvocationContext) -> Result<bool> {
        let node = match self.container.peek(fqn, false, true) {
            Some(node) => node,
            None => return Ok(false),
        };
        let owner = ctx.lock_owner();
        let acquisition = self.lock_node(&node, mode, &owner, ctx.lock_timeout())?;
        match acquisition {
            Acquisition::Acquired => ctx.record_lock(AcquiredLock::node(node, mode)),
            Acquisition::Upgraded => ctx.promote_lock(fqn),
            Acquisition::AlreadyHeld => {}
        }
        Ok(acquisition.needs_release())
    }

    fn number_of_locks_held(&self) -> usize {
        self.container.locked_node_count()
    }
}

// =============================================================================
// Tests
// =============================================================================
