//! Pessimistic Lock Interceptor
//!
//! Locks every path a command touches before it runs, according to the
//! configured isolation level, and completes the in-place changes of a
//! transaction at its boundary: commit purges tombstoned subtrees, rollback
//! replays the undo log. Invocation-scoped locks are released when the
//! call returns, transaction-scoped locks at commit or rollback.

use std::sync::Arc;

use tracing::{debug, error, trace};

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::config::IsolationLevel;
use crate::context::InvocationContext;
use crate::error::Result;
use crate::lock::{LockManager, PathLockRequest, PessimisticLockManager};
use crate::tree::view::{purge_tombstones, undo_transaction};
use crate::tree::DataContainer;

pub struct PessimisticLockInterceptor {
    manager: PessimisticLockManager,
    container: Arc<DataContainer>,
    isolation: IsolationLevel,
    lock_parent: bool,
}

impl PessimisticLockInterceptor {
    pub fn new(
        manager: PessimisticLockManager,
        container: Arc<DataContainer>,
        isolation: IsolationLevel,
        lock_parent: bool,
    ) -> Self {
        Self {
            manager,
            container,
            isolation,
            lock_parent,
        }
    }

    /// Request used for reads, `None` when reads run unlocked
    fn read_request(&self, ctx: &InvocationContext) -> Option<PathLockRequest> {
        if ctx.options().force_write_lock {
            return Some(PathLockRequest::write());
        }
        match self.isolation {
            IsolationLevel::None | IsolationLevel::ReadUncommitted => None,
            IsolationLevel::ReadCommitted => Some(PathLockRequest::read().invocation_scoped()),
            IsolationLevel::RepeatableRead => Some(PathLockRequest::read()),
            IsolationLevel::Serializable => Some(PathLockRequest::write()),
        }
    }

    fn acquire(&self, ctx: &mut InvocationContext, command: &Command) -> Result<()> {
        if ctx.options().suppress_locking || self.isolation == IsolationLevel::None {
            return Ok(());
        }

        match command {
            Command::Put { fqn, .. } | Command::PutKeyValue { fqn, .. } | Command::PutForExternalRead { fqn, .. } => {
                let request = PathLockRequest::write().creating().with_parent(self.lock_parent);
                self.manager.acquire_path(fqn, request, ctx)
            }
            Command::RemoveNode { fqn } => {
                let request = PathLockRequest::write().with_parent(self.lock_parent).with_descendants();
                self.manager.acquire_path(fqn, request, ctx)
            }
            Command::RemoveKey { fqn, .. } | Command::ClearData { fqn } => {
                self.manager.acquire_path(fqn, PathLockRequest::write(), ctx)
            }
            Command::Move { from, to_parent } => {
                let request = PathLockRequest::write().with_parent(true).with_descendants();
                self.manager.acquire_path(from, request, ctx)?;
                self.manager.acquire_path(to_parent, PathLockRequest::write(), ctx)
            }
            Command::Evict { fqn, recursive } => {
                let mut request = PathLockRequest::write().invocation_scoped();
                if *recursive {
                    request = request.with_descendants();
                }
                self.manager.acquire_path(fqn, request, ctx)
            }
            Command::Invalidate { fqn } => {
                let request = PathLockRequest::write().invocation_scoped().with_descendants();
                self.manager.acquire_path(fqn, request, ctx)
            }
            command if command.is_read() => match (self.read_request(ctx), command.fqn()) {
                (Some(request), Some(fqn)) => self.manager.acquire_path(fqn, request, ctx),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn release_invocation(&self, ctx: &mut InvocationContext) {
        let locks = ctx.take_invocation_locks();
        if locks.is_empty() {
            return;
        }
        let owner = ctx.lock_owner();
        trace!(owner = %owner, count = locks.len(), "releasing invocation locks");
        if let Err(e) = self.manager.release_all(locks, &owner) {
            error!(owner = %owner, error = %e, "failed to release invocation locks");
        }
    }

    /// Apply (`commit`) or undo the transaction's changes, then release
    /// its locks
    fn complete(&self, ctx: &mut InvocationContext, commit: bool) {
        let Some(context) = ctx.tx_context() else { return };
        let owner = ctx.lock_owner();
        let locks = {
            let mut tx = context.lock();
            if commit {
                for fqn in std::mem::take(&mut tx.removed) {
                    purge_tombstones(&self.container, &fqn);
                }
                tx.undo.clear();
                tx.created.clear();
            } else {
                undo_transaction(&self.container, &mut tx);
            }
            std::mem::take(&mut tx.locks)
        };
        debug!(owner = %owner, commit, locks = locks.len(), "transaction locks released");
        if let Err(e) = self.manager.release_all(locks, &owner) {
            error!(owner = %owner, error = %e, "failed to release transaction locks");
        }
    }
}

impl Interceptor for PessimisticLockInterceptor {
    fn name(&self) -> &str {
        "PessimisticLockInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        let result = match command {
            Command::Prepare { .. } => next.invoke(ctx, command),
            Command::Commit { .. } => {
                let result = next.invoke(ctx, command);
                self.complete(ctx, true);
                result
            }
            Command::Rollback { .. } => {
                let result = next.invoke(ctx, command);
                self.complete(ctx, false);
                result
            }
            _ => self.acquire(ctx, command).and_then(|_| next.invoke(ctx, command)),
        };
        self.release_invocation(ctx);
        result
    }
}

// =============================================================================
// Tests
// =============================================================================
