//! Call Interceptor
//!
//! Terminal stage: performs the command against the tree through the data
//! view of the configured scheme and fires the pre and post node events
//! around each change. The view is re-opened for every step, so listeners
//! never run while the transaction's state is locked.

use std::sync::Arc;

use tracing::trace;

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::domain::events::{CacheEvent, EventKind, ModificationType};
use crate::error::Result;
use crate::fqn::Fqn;
use crate::notifier::Notifier;
use crate::transaction::GlobalTransaction;
use crate::tree::{DataContainer, DataView, DirectView, NodeData, WorkspaceView};

/// Which data view commands run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// In-place mutation with an undo log
    Pessimistic,
    /// Copy-on-write working copies
    Mvcc { repeatable_read: bool },
}

pub struct CallInterceptor {
    kind: ViewKind,
    container: Arc<DataContainer>,
    notifier: Arc<Notifier>,
}

/// Origin and transaction of the running invocation, stamped on events
struct Source {
    origin_local: bool,
    tx: Option<GlobalTransaction>,
}

impl CallInterceptor {
    pub fn new(kind: ViewKind, container: Arc<DataContainer>, notifier: Arc<Notifier>) -> Self {
        Self {
            kind,
            container,
            notifier,
        }
    }

    /// Run `f` against the view for this invocation
    fn view<R>(&self, ctx: &mut InvocationContext, f: impl FnOnce(&mut dyn DataView) -> R) -> R {
        let context = ctx.tx_context();
        match (self.kind, context) {
            (ViewKind::Pessimistic, Some(context)) => {
                let mut tx = context.lock();
                f(&mut DirectView::new(&self.container, Some(&mut *tx)))
            }
            (ViewKind::Pessimistic, None) => f(&mut DirectView::new(&self.container, None)),
            (ViewKind::Mvcc { repeatable_read }, Some(context)) => {
                let mut tx = context.lock();
                f(&mut WorkspaceView::new(&self.container, &mut tx.workspace, repeatable_read))
            }
            (ViewKind::Mvcc { repeatable_read }, None) => {
                f(&mut WorkspaceView::new(&self.container, ctx.workspace_mut(), repeatable_read))
            }
        }
    }

    fn visited(&self, fqn: &Fqn) -> Result<()> {
        for pre in [true, false] {
            self.notifier
                .notify_with(EventKind::NodeVisited, || CacheEvent::node_visited(fqn.clone(), pre))?;
        }
        Ok(())
    }

    fn created(&self, fqn: &Fqn, pre: bool, source: &Source) -> Result<()> {
        self.notifier.notify_with(EventKind::NodeCreated, || {
            CacheEvent::node_created(fqn.clone(), pre, source.origin_local, source.tx.clone())
        })
    }

    fn modified(
        &self,
        fqn: &Fqn,
        pre: bool,
        source: &Source,
        modification: ModificationType,
        data: impl FnOnce() -> Option<NodeData>,
    ) -> Result<()> {
        self.notifier.notify_with(EventKind::NodeModified, || {
            CacheEvent::node_modified(fqn.clone(), pre, source.origin_local, source.tx.clone(), modification, data())
        })
    }

    fn removed(&self, fqn: &Fqn, pre: bool, source: &Source) -> Result<()> {
        self.notifier.notify_with(EventKind::NodeRemoved, || {
            CacheEvent::node_removed(fqn.clone(), pre, source.origin_local, source.tx.clone())
        })
    }

    /// Write to `fqn`, firing creation and modification events around it
    fn write<R>(
        &self,
        ctx: &mut InvocationContext,
        fqn: &Fqn,
        source: &Source,
        modification: ModificationType,
        f: impl FnOnce(&mut dyn DataView) -> R,
    ) -> Result<R> {
        let prior = self.view(ctx, |view| view.data(fqn));
        let creating = prior.is_none();

        if creating {
            self.created(fqn, true, source)?;
        }
        self.modified(fqn, true, source, modification, || prior.clone())?;

        let result = self.view(ctx, f);

        if creating {
            self.created(fqn, false, source)?;
        }
        if self.notifier.has_listeners(EventKind::NodeModified) {
            let data = self.view(ctx, |view| view.data(fqn));
            self.modified(fqn, false, source, modification, || data)?;
        }
        Ok(result)
    }

    fn evict(&self, fqn: &Fqn, recursive: bool) -> Result<CommandResult> {
        let candidates = self.container.nodes_for_eviction(fqn, recursive);
        if candidates.is_empty() {
            return Ok(CommandResult::Bool(false));
        }
        let mut removed = false;
        for candidate in candidates.iter().rev() {
            self.notifier
                .notify_with(EventKind::NodeEvicted, || CacheEvent::node_evicted(candidate.clone(), true))?;
            removed = self.container.evict(candidate);
            trace!(fqn = %candidate, removed, "evicted node");
            self.notifier
                .notify_with(EventKind::NodeEvicted, || CacheEvent::node_evicted(candidate.clone(), false))?;
        }
        Ok(CommandResult::Bool(removed))
    }

    fn invalidate(&self, fqn: &Fqn, source: &Source) -> Result<CommandResult> {
        if self.container.peek_strict(fqn).is_none() {
            return Ok(CommandResult::Bool(false));
        }
        self.notifier.notify_with(EventKind::NodeInvalidated, || {
            CacheEvent::node_invalidated(fqn.clone(), true, source.origin_local)
        })?;
        for node in self.container.subtree(fqn).into_iter().rev() {
            self.container.evict(node.fqn());
        }
        trace!(fqn = %fqn, "invalidated subtree");
        self.notifier.notify_with(EventKind::NodeInvalidated, || {
            CacheEvent::node_invalidated(fqn.clone(), false, source.origin_local)
        })?;
        Ok(CommandResult::Bool(true))
    }
}

impl Interceptor for CallInterceptor {
    fn name(&self) -> &str {
        "CallInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, _next: Next<'_>) -> Result<CommandResult> {
        let source = Source {
            origin_local: ctx.is_origin_local(),
            tx: ctx.transaction().cloned(),
        };

        match command {
            // ----- reads -----
            Command::Get { fqn, key } => {
                let data = self.view(ctx, |view| view.data(fqn));
                if data.is_some() {
                    self.visited(fqn)?;
                }
                Ok(CommandResult::Value(data.and_then(|mut data| data.remove(key))))
            }
            Command::GetData { fqn } => {
                let data = self.view(ctx, |view| view.data(fqn));
                if data.is_some() {
                    self.visited(fqn)?;
                }
                Ok(CommandResult::Data(data))
            }
            Command::GetKeys { fqn } => {
                let keys = self.view(ctx, |view| view.keys(fqn));
                if keys.is_some() {
                    self.visited(fqn)?;
                }
                Ok(CommandResult::Keys(keys))
            }
            Command::GetChildrenNames { fqn } => {
                let children = self.view(ctx, |view| view.children_names(fqn));
                if children.is_some() {
                    self.visited(fqn)?;
                }
                Ok(CommandResult::Children(children))
            }
            Command::GetNode { fqn } => {
                let snapshot = self.view(ctx, |view| view.snapshot(fqn));
                if snapshot.is_some() {
                    self.visited(fqn)?;
                }
                Ok(CommandResult::Node(snapshot))
            }
            Command::Exists { fqn } => Ok(CommandResult::Bool(self.view(ctx, |view| view.exists(fqn)))),

            // ----- writes -----
            Command::Put { fqn, data, erase } => {
                self.write(ctx, fqn, &source, ModificationType::PutMap, |view| {
                    view.put(fqn, data.clone(), *erase)
                })?;
                Ok(CommandResult::None)
            }
            Command::PutKeyValue { fqn, key, value } => {
                let previous = self.write(ctx, fqn, &source, ModificationType::PutData, |view| {
                    view.put_key(fqn, key, value.clone())
                })?;
                Ok(CommandResult::Value(previous))
            }
            Command::PutForExternalRead { fqn, key, value } => {
                if self.view(ctx, |view| view.get(fqn, key)).is_some() {
                    trace!(fqn = %fqn, key = %key, "external read already cached");
                    return Ok(CommandResult::None);
                }
                self.write(ctx, fqn, &source, ModificationType::PutData, |view| {
                    view.put_key(fqn, key, value.clone())
                })?;
                Ok(CommandResult::None)
            }
            Command::RemoveNode { fqn } => {
                if !self.view(ctx, |view| view.exists(fqn)) {
                    return Ok(CommandResult::Bool(false));
                }
                self.removed(fqn, true, &source)?;
                let removed = self.view(ctx, |view| view.remove_node(fqn));
                self.removed(fqn, false, &source)?;
                Ok(CommandResult::Bool(removed))
            }
            Command::RemoveKey { fqn, key } => {
                if self.view(ctx, |view| view.get(fqn, key)).is_none() {
                    return Ok(CommandResult::Value(None));
                }
                let removed = self.write(ctx, fqn, &source, ModificationType::RemoveData, |view| {
                    view.remove_key(fqn, key)
                })?;
                Ok(CommandResult::Value(removed))
            }
            Command::ClearData { fqn } => {
                if !self.view(ctx, |view| view.exists(fqn)) {
                    return Ok(CommandResult::Bool(false));
                }
                let cleared = self.write(ctx, fqn, &source, ModificationType::RemoveData, |view| {
                    view.clear_data(fqn)
                })?;
                Ok(CommandResult::Bool(cleared))
            }
            Command::Move { from, to_parent } => {
                let to = from
                    .last_element()
                    .map(|name| to_parent.child(name.clone()))
                    .unwrap_or_else(|| to_parent.clone());
                self.notifier.notify_with(EventKind::NodeMoved, || {
                    CacheEvent::node_moved(from.clone(), to.clone(), true, source.origin_local, source.tx.clone())
                })?;
                let moved_to = self.view(ctx, |view| view.move_node(from, to_parent))?;
                self.notifier.notify_with(EventKind::NodeMoved, || {
                    CacheEvent::node_moved(from.clone(), moved_to, false, source.origin_local, source.tx.clone())
                })?;
                Ok(CommandResult::None)
            }

            // ----- structural maintenance -----
            Command::Evict { fqn, recursive } => self.evict(fqn, *recursive),
            Command::Invalidate { fqn } => self.invalidate(fqn, &source),

            Command::Prepare { .. } | Command::Commit { .. } | Command::Rollback { .. } => Ok(CommandResult::None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
