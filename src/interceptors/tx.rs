//! Transaction Interceptor
//!
//! Enlists the cache in the calling thread's transaction on first use,
//! records the transaction's modifications, and drives prepare, commit and
//! rollback. A local transaction completes through a [`Synchronization`]
//! that sends `Prepare`, then `Commit` or `Rollback`, back through the
//! chain. A transaction received from another member arrives as one
//! `Prepare` carrying its modifications; each is replayed through the rest
//! of the chain under a remote transaction context.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{Interceptor, InterceptorChain, Next};
use crate::commands::{Command, CommandResult, ReplicableCommand};
use crate::context::{InvocationContext, Options, TxHandle};
use crate::domain::events::{CacheEvent, EventKind};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::transaction::{
    GlobalTransaction, Synchronization, Transaction, TransactionManager, TransactionStatus, TransactionTable,
};

pub struct TxInterceptor {
    tm: Arc<TransactionManager>,
    table: Arc<TransactionTable>,
    notifier: Arc<Notifier>,
    lock_timeout: Duration,
}

impl TxInterceptor {
    pub fn new(
        tm: Arc<TransactionManager>,
        table: Arc<TransactionTable>,
        notifier: Arc<Notifier>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            tm,
            table,
            notifier,
            lock_timeout,
        }
    }

    /// Evict, invalidate and external-read puts run outside any transaction
    fn enlists(command: &Command) -> bool {
        !matches!(
            command,
            Command::Evict { .. } | Command::Invalidate { .. } | Command::PutForExternalRead { .. }
        ) && !command.is_transaction_boundary()
    }

    fn attach(&self, ctx: &mut InvocationContext, gtx: &GlobalTransaction) -> bool {
        match self.table.get(gtx) {
            Some(context) => {
                ctx.set_transaction(Some(TxHandle {
                    gtx: gtx.clone(),
                    context,
                }));
                true
            }
            None => false,
        }
    }

    fn enlist(&self, ctx: &mut InvocationContext, tx: &Arc<Transaction>) -> Result<()> {
        let gtx = tx.gtx().clone();
        let (context, created) = self.table.get_or_create(&gtx, false);
        if created {
            let chain = ctx
                .chain()
                .cloned()
                .ok_or_else(|| Error::InvalidState("invocation is not running through a chain".to_string()))?;
            let sync = Arc::new(CacheSynchronization {
                gtx: gtx.clone(),
                chain,
                lock_timeout: self.lock_timeout,
            });
            if let Err(e) = tx.register_synchronization(sync) {
                self.table.remove(&gtx);
                return Err(e);
            }
            debug!(gtx = %gtx, "cache enlisted in transaction");
            self.notifier
                .notify_with(EventKind::TransactionRegistered, || CacheEvent::transaction_registered(gtx.clone()))?;
        }
        ctx.set_transaction(Some(TxHandle { gtx, context }));
        Ok(())
    }

    fn handle_remote_prepare(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        gtx: &GlobalTransaction,
        modifications: &[ReplicableCommand],
        one_phase: bool,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let (context, _) = self.table.get_or_create(gtx, true);
        ctx.set_transaction(Some(TxHandle {
            gtx: gtx.clone(),
            context: Arc::clone(&context),
        }));
        trace!(gtx = %gtx, modifications = modifications.len(), one_phase, "replaying remote transaction");

        let mut replay = || -> Result<CommandResult> {
            for modification in modifications {
                let Some(replayed) = modification.clone().into_command() else { continue };
                next.invoke(ctx, &replayed)?;
                context.lock().modifications.push(modification.clone());
            }
            next.invoke(ctx, command)
        };

        match replay() {
            Ok(result) if one_phase => {
                let committed = next.invoke(ctx, &Command::Commit { gtx: gtx.clone() });
                self.table.remove(gtx);
                committed.map(|_| result)
            }
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(gtx = %gtx, error = %e, "remote prepare failed, rolling back");
                if let Err(rollback_error) = next.invoke(ctx, &Command::Rollback { gtx: gtx.clone() }) {
                    warn!(gtx = %gtx, error = %rollback_error, "remote rollback failed");
                }
                self.table.remove(gtx);
                Err(e)
            }
        }
    }

    fn handle_completion(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        gtx: &GlobalTransaction,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if !self.attach(ctx, gtx) {
            trace!(gtx = %gtx, command = %command, "no state for transaction, nothing to complete");
            return Ok(CommandResult::None);
        }
        let result = next.invoke(ctx, command);
        self.table.remove(gtx);
        debug!(gtx = %gtx, command = %command, ok = result.is_ok(), "transaction completed");
        result
    }

    fn record(&self, ctx: &InvocationContext, command: &Command) {
        let (Some(context), Some(replicable)) = (ctx.tx_context(), command.to_replicable()) else { return };
        let mut context = context.lock();
        if !ctx.options().cache_mode_local {
            context.replicable.push(replicable.clone());
        }
        context.modifications.push(replicable);
    }

    fn mark_rollback_only(&self, ctx: &InvocationContext, error: &Error) {
        let Some(gtx) = ctx.transaction() else { return };
        if let Some(tx) = self.tm.current().filter(|tx| tx.gtx() == gtx) {
            tx.set_rollback_only();
            debug!(gtx = %gtx, error = %error, "transaction marked rollback-only");
        }
    }
}

impl Interceptor for TxInterceptor {
    fn name(&self) -> &str {
        "TxInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        match command {
            Command::Prepare {
                gtx,
                modifications,
                one_phase,
            } if !ctx.is_origin_local() => {
                return self.handle_remote_prepare(ctx, command, gtx, modifications, *one_phase, next)
            }
            Command::Prepare { gtx, .. } => {
                if !self.attach(ctx, gtx) {
                    return Ok(CommandResult::None);
                }
                return next.invoke(ctx, command);
            }
            Command::Commit { gtx } | Command::Rollback { gtx } => {
                return self.handle_completion(ctx, command, gtx, next)
            }
            _ => {}
        }

        if ctx.is_origin_local() && !ctx.is_in_transaction() && Self::enlists(command) {
            if let Some(tx) = self.tm.current() {
                match tx.status() {
                    TransactionStatus::Active | TransactionStatus::MarkedRollback => self.enlist(ctx, &tx)?,
                    other => {
                        return Err(Error::InvalidState(format!(
                            "{} is {:?}, cannot run {}",
                            tx.gtx(),
                            other,
                            command
                        )))
                    }
                }
            }
        }

        let result = next.invoke(ctx, command);
        if ctx.is_in_transaction() {
            match &result {
                Ok(_) if command.is_write() => self.record(ctx, command),
                Err(e) if e.forces_rollback() => self.mark_rollback_only(ctx, e),
                _ => {}
            }
        }
        result
    }
}

// =============================================================================
// Synchronization
// =============================================================================

/// Completes the cache's share of a local transaction
struct CacheSynchronization {
    gtx: GlobalTransaction,
    chain: InterceptorChain,
    lock_timeout: Duration,
}

impl CacheSynchronization {
    fn run(&self, command: Command) -> Result<()> {
        let mut ctx = InvocationContext::new(Options::default(), self.lock_timeout);
        self.chain.invoke(&mut ctx, &command).map(|_| ())
    }
}

impl Synchronization for CacheSynchronization {
    fn before_completion(&self) -> Result<()> {
        self.run(Command::Prepare {
            gtx: self.gtx.clone(),
            modifications: Vec::new(),
            one_phase: false,
        })
    }

    fn after_completion(&self, status: TransactionStatus) -> Result<()> {
        let gtx = self.gtx.clone();
        match status {
            TransactionStatus::Committed => self.run(Command::Commit { gtx }),
            _ => self.run(Command::Rollback { gtx }),
        }
    }
}
