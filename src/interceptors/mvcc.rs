//! MVCC Locking Interceptor
//!
//! Writers take striped write locks on every path they will change; readers
//! take nothing. Changes accumulate in a workspace (the invocation's, or the
//! transaction's) and are applied to the committed tree while the locks are
//! still held: at the end of a non-transactional call, or at commit.

use std::sync::Arc;

use tracing::{debug, error, trace};

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::lock::{LockManager, LockMode, LockStrategy};
use crate::tree::DataContainer;

pub struct MvccLockingInterceptor {
    locks: LockStrategy,
    container: Arc<DataContainer>,
    repeatable_read: bool,
    write_skew_check: bool,
    lock_parent: bool,
}

impl MvccLockingInterceptor {
    pub fn new(
        locks: LockStrategy,
        container: Arc<DataContainer>,
        repeatable_read: bool,
        write_skew_check: bool,
        lock_parent: bool,
    ) -> Self {
        Self {
            locks,
            container,
            repeatable_read,
            write_skew_check,
            lock_parent,
        }
    }

    fn lock(&self, ctx: &mut InvocationContext, fqn: &Fqn) -> Result<()> {
        self.locks.lock_and_record(fqn, LockMode::Write, ctx).map(|_| ())
    }

    fn lock_parent_of(&self, ctx: &mut InvocationContext, fqn: &Fqn) -> Result<()> {
        if fqn.is_root() {
            return Ok(());
        }
        self.lock(ctx, &fqn.parent())
    }

    /// Lock `fqn` and every ancestor the write would have to create
    ///
    /// With `lock_parent` the direct parent is locked even when it exists,
    /// so sibling inserts and removals serialize on it.
    fn lock_for_create(&self, ctx: &mut InvocationContext, fqn: &Fqn) -> Result<()> {
        self.lock(ctx, fqn)?;
        let mut current = fqn.clone();
        while !current.is_root() {
            current = current.parent();
            if self.container.peek_strict(&current).is_some() {
                if self.lock_parent && current.size() + 1 == fqn.size() {
                    self.lock(ctx, &current)?;
                }
                break;
            }
            self.lock(ctx, &current)?;
        }
        Ok(())
    }

    fn lock_subtree(&self, ctx: &mut InvocationContext, fqn: &Fqn) -> Result<()> {
        self.lock(ctx, fqn)?;
        for node in self.container.subtree(fqn).into_iter().skip(1) {
            self.lock(ctx, node.fqn())?;
        }
        Ok(())
    }

    fn acquire(&self, ctx: &mut InvocationContext, command: &Command) -> Result<()> {
        if ctx.options().suppress_locking {
            return Ok(());
        }

        match command {
            Command::Put { fqn, .. } | Command::PutKeyValue { fqn, .. } | Command::PutForExternalRead { fqn, .. } => {
                self.lock_for_create(ctx, fqn)
            }
            Command::RemoveNode { fqn } => {
                if self.lock_parent {
                    self.lock_parent_of(ctx, fqn)?;
                }
                self.lock_subtree(ctx, fqn)
            }
            Command::RemoveKey { fqn, .. } | Command::ClearData { fqn } => self.lock(ctx, fqn),
            Command::Move { from, to_parent } => {
                self.lock_parent_of(ctx, from)?;
                self.lock_subtree(ctx, from)?;
                self.lock(ctx, to_parent)?;
                if let Some(name) = from.last_element() {
                    self.lock(ctx, &to_parent.child(name.clone()))?;
                }
                Ok(())
            }
            Command::Evict { fqn, recursive: true } | Command::Invalidate { fqn } => self.lock_subtree(ctx, fqn),
            Command::Evict { fqn, .. } => self.lock(ctx, fqn),
            command if command.is_read() && ctx.options().force_write_lock => match command.fqn() {
                Some(fqn) => self.lock(ctx, fqn),
                None => Ok(()),
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
        trace!(owner = %owner, count = locks.len(), "releasing invocation stripes");
        if let Err(e) = self.locks.release_all(locks, &owner) {
            error!(owner = %owner, error = %e, "failed to release invocation stripes");
        }
    }

    /// Apply (`commit`) or discard the transaction's workspace, then
    /// release its stripes
    fn complete(&self, ctx: &mut InvocationContext, commit: bool) {
        let Some(context) = ctx.tx_context() else { return };
        let owner = ctx.lock_owner();
        let locks = {
            let mut tx = context.lock();
            let workspace = std::mem::take(&mut tx.workspace);
            if commit {
                debug!(owner = %owner, nodes = workspace.modified().len(), "applying transaction workspace");
                workspace.apply(&self.container);
            }
            std::mem::take(&mut tx.locks)
        };
        if let Err(e) = self.locks.release_all(locks, &owner) {
            error!(owner = %owner, error = %e, "failed to release transaction stripes");
        }
    }

    fn check_write_skew(&self, ctx: &InvocationContext) -> Result<()> {
        if !(self.repeatable_read && self.write_skew_check) {
            return Ok(());
        }
        match ctx.tx_context() {
            Some(context) => context.lock().workspace.check_write_skew(&self.container),
            None => Ok(()),
        }
    }
}

impl Interceptor for MvccLockingInterceptor {
    fn name(&self) -> &str {
        "MvccLockingInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        let result = match command {
            Command::Prepare { .. } => self.check_write_skew(ctx).and_then(|_| next.invoke(ctx, command)),
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
            _ => {
                let result = self.acquire(ctx, command).and_then(|_| next.invoke(ctx, command));
                if !ctx.is_in_transaction() {
                    let workspace = ctx.take_workspace();
                    if result.is_ok() {
                        workspace.apply(&self.container);
                    }
                }
                result
            }
        };
        self.release_invocation(ctx);
        result
    }
}

// =============================================================================
// Tests
// =============================================================================
