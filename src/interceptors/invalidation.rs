//! Invalidation Interceptor
//!
//! Instead of shipping changes, tells the other members to drop their copy
//! of every node this member changed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult, ReplicableCommand};
use crate::context::InvocationContext;
use crate::domain::ports::{DeliveryMode, Transport};
use crate::error::Result;
use crate::fqn::Fqn;

pub struct InvalidationInterceptor {
    transport: Arc<dyn Transport>,
    mode: DeliveryMode,
    timeout: Duration,
}

impl InvalidationInterceptor {
    pub fn new(transport: Arc<dyn Transport>, mode: DeliveryMode, timeout: Duration) -> Self {
        Self {
            transport,
            mode,
            timeout,
        }
    }

    /// Nodes made stale elsewhere by `command`
    fn affected(command: &ReplicableCommand) -> Vec<Fqn> {
        match command {
            ReplicableCommand::Move { from, to_parent } => {
                let mut fqns = vec![from.clone()];
                if let Some(name) = from.last_element() {
                    fqns.push(to_parent.child(name.clone()));
                }
                fqns
            }
            other => other.fqn().cloned().into_iter().collect(),
        }
    }

    fn invalidate(&self, fqns: impl IntoIterator<Item = Fqn>) -> Result<()> {
        for fqn in fqns {
            debug!(fqn = %fqn, mode = %self.mode, "invalidating remote copies");
            self.transport
                .broadcast(&ReplicableCommand::Invalidate { fqn }, self.mode, self.timeout)?;
        }
        Ok(())
    }

    fn tx_fqns(ctx: &InvocationContext) -> BTreeSet<Fqn> {
        ctx.tx_context()
            .map(|context| context.lock().replicable.iter().flat_map(Self::affected).collect())
            .unwrap_or_default()
    }
}

impl Interceptor for InvalidationInterceptor {
    fn name(&self) -> &str {
        "InvalidationInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        if !ctx.is_origin_local() {
            return next.invoke(ctx, command);
        }

        match command {
            Command::Prepare { .. } if self.mode == DeliveryMode::Sync => {
                let result = next.invoke(ctx, command)?;
                self.invalidate(Self::tx_fqns(ctx))?;
                Ok(result)
            }
            Command::Commit { gtx } if self.mode == DeliveryMode::Async => {
                let result = next.invoke(ctx, command)?;
                if let Err(e) = self.invalidate(Self::tx_fqns(ctx)) {
                    warn!(gtx = %gtx, error = %e, "invalidation after commit failed");
                }
                Ok(result)
            }
            Command::PutForExternalRead { .. } => next.invoke(ctx, command),
            _ if command.is_write() && !ctx.is_in_transaction() => {
                let result = next.invoke(ctx, command)?;
                if !ctx.options().cache_mode_local {
                    if let Some(replicable) = command.to_replicable() {
                        self.invalidate(Self::affected(&replicable))?;
                    }
                }
                Ok(result)
            }
            _ => next.invoke(ctx, command),
        }
    }
}
