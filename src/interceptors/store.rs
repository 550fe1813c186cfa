//! Cache Store and Passivation Interceptors
//!
//! The store interceptor writes changes through to the cache loader:
//! immediately for non-transactional calls, staged at prepare and applied
//! at commit for transactions. With passivation the loader is only written
//! when nodes leave memory: the passivation interceptor saves each node's
//! data just before it is evicted.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::domain::events::{CacheEvent, EventKind};
use crate::domain::ports::{CacheLoader, Modification};
use crate::error::Result;
use crate::fqn::Fqn;
use crate::notifier::Notifier;
use crate::tree::DataContainer;

// =============================================================================
// Write-through
// =============================================================================

pub struct CacheStoreInterceptor {
    loader: Arc<dyn CacheLoader>,
    shared: bool,
    ignore_modifications: bool,
}

impl CacheStoreInterceptor {
    pub fn new(loader: Arc<dyn CacheLoader>, shared: bool, ignore_modifications: bool) -> Self {
        Self {
            loader,
            shared,
            ignore_modifications,
        }
    }

    fn tx_modifications(ctx: &InvocationContext) -> Vec<Modification> {
        ctx.tx_context()
            .map(|context| {
                context
                    .lock()
                    .modifications
                    .iter()
                    .filter_map(|m| m.to_modification())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Interceptor for CacheStoreInterceptor {
    fn name(&self) -> &str {
        "CacheStoreInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        // A shared store is written once, by the member the change came from
        if self.ignore_modifications || (self.shared && !ctx.is_origin_local()) {
            return next.invoke(ctx, command);
        }

        match command {
            Command::Prepare { gtx, .. } => {
                let result = next.invoke(ctx, command)?;
                let modifications = Self::tx_modifications(ctx);
                if !modifications.is_empty() {
                    debug!(gtx = %gtx, count = modifications.len(), "staging modifications in store");
                    self.loader.prepare(gtx, &modifications, false)?;
                }
                Ok(result)
            }
            Command::Commit { gtx } => {
                let result = next.invoke(ctx, command)?;
                self.loader.commit(gtx)?;
                Ok(result)
            }
            Command::Rollback { gtx } => {
                let result = next.invoke(ctx, command);
                self.loader.rollback(gtx);
                result
            }
            _ if command.is_write() && !ctx.is_in_transaction() => {
                let result = next.invoke(ctx, command)?;
                if let Some(modification) = command.to_replicable().and_then(|r| r.to_modification()) {
                    trace!(command = %command, "writing through to store");
                    self.loader.apply(&[modification])?;
                }
                Ok(result)
            }
            _ => next.invoke(ctx, command),
        }
    }
}

// =============================================================================
// Passivation
// =============================================================================

pub struct PassivationInterceptor {
    loader: Arc<dyn CacheLoader>,
    container: Arc<DataContainer>,
    notifier: Arc<Notifier>,
}

impl PassivationInterceptor {
    pub fn new(loader: Arc<dyn CacheLoader>, container: Arc<DataContainer>, notifier: Arc<Notifier>) -> Self {
        Self {
            loader,
            container,
            notifier,
        }
    }

    /// Save the data of `fqn` to the store, replacing what was there
    fn passivate(&self, fqn: &Fqn) -> Result<()> {
        let Some(node) = self.container.peek_strict(fqn) else { return Ok(()) };
        let data = {
            let state = node.read();
            if !state.is_data_loaded() {
                return Ok(());
            }
            state.data().clone()
        };

        self.notifier.notify_with(EventKind::NodePassivated, || {
            CacheEvent::node_passivated(fqn.clone(), true, Some(data.clone()))
        })?;
        self.loader.remove_data(fqn)?;
        self.loader.put(fqn, &data)?;
        trace!(fqn = %fqn, keys = data.len(), "passivated node");
        self.notifier
            .notify_with(EventKind::NodePassivated, || CacheEvent::node_passivated(fqn.clone(), false, None))
    }
}

impl Interceptor for PassivationInterceptor {
    fn name(&self) -> &str {
        "PassivationInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        if let Command::Evict { fqn, recursive } = command {
            for candidate in self.container.nodes_for_eviction(fqn, *recursive) {
                self.passivate(&candidate)?;
            }
        }
        next.invoke(ctx, command)
    }
}

// =============================================================================
// Tests
// =============================================================================
