//! Cache Loader Interceptor
//!
//! Read-through: before a command touches a node whose data has not been
//! loaded, the stored data is merged into the in-memory node (keys written
//! in memory win). With activation the stored copy is then dropped, since
//! the node now lives in memory again until its next passivation.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::domain::events::{CacheEvent, EventKind};
use crate::domain::ports::CacheLoader;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::notifier::Notifier;
use crate::tree::DataContainer;

pub struct CacheLoaderInterceptor {
    loader: Arc<dyn CacheLoader>,
    container: Arc<DataContainer>,
    notifier: Arc<Notifier>,
    activation: bool,
}

impl CacheLoaderInterceptor {
    pub fn new(loader: Arc<dyn CacheLoader>, container: Arc<DataContainer>, notifier: Arc<Notifier>) -> Self {
        Self {
            loader,
            container,
            notifier,
            activation: false,
        }
    }

    /// Loader that activates passivated nodes
    pub fn activating(loader: Arc<dyn CacheLoader>, container: Arc<DataContainer>, notifier: Arc<Notifier>) -> Self {
        Self {
            activation: true,
            ..Self::new(loader, container, notifier)
        }
    }

    /// Load the node at `fqn`; with `children`, also create placeholders
    /// for stored children not yet in memory
    fn load(&self, fqn: &Fqn, children: bool) -> Result<()> {
        let node = self.container.peek(fqn, false, true);
        if node.as_ref().map(|n| n.is_deleted()).unwrap_or(false) {
            return Ok(());
        }

        let needs_data = node.as_ref().map(|n| !n.read().is_data_loaded()).unwrap_or(true);
        if needs_data {
            match (self.loader.get(fqn)?, node) {
                (Some(data), node) => {
                    let kind = if self.activation {
                        EventKind::NodeActivated
                    } else {
                        EventKind::NodeLoaded
                    };
                    self.notify(kind, fqn, true, None)?;

                    let target = match node {
                        Some(node) => node,
                        None => self.container.create_nodes(fqn).target,
                    };
                    {
                        let mut state = target.write();
                        for (key, value) in data.iter() {
                            if state.get(key).is_none() {
                                state.put(key.clone(), value.clone());
                            }
                        }
                        state.set_data_loaded(true);
                    }
                    trace!(fqn = %fqn, keys = data.len(), activation = self.activation, "loaded node");

                    self.notify(kind, fqn, false, Some(data))?;
                    if self.activation {
                        self.drop_stored(fqn)?;
                    }
                }
                (None, Some(node)) => node.write().set_data_loaded(true),
                (None, None) => {}
            }
        }

        if children && self.container.peek_strict(fqn).is_some() {
            if let Some(names) = self.loader.get_children_names(fqn)? {
                for name in names {
                    let child = fqn.child(name);
                    if self.container.peek(&child, false, true).is_none() {
                        self.container.create_nodes(&child);
                    }
                }
            }
        }
        Ok(())
    }

    fn load_subtree(&self, fqn: &Fqn) -> Result<()> {
        self.load(fqn, true)?;
        if let Some(names) = self.container.children_names(fqn) {
            for name in names {
                self.load_subtree(&fqn.child(name))?;
            }
        }
        Ok(())
    }

    /// Remove an activated node from the store, keeping stored children
    fn drop_stored(&self, fqn: &Fqn) -> Result<()> {
        let has_children = self
            .loader
            .get_children_names(fqn)?
            .map(|names| !names.is_empty())
            .unwrap_or(false);
        if has_children {
            self.loader.remove_data(fqn)
        } else {
            self.loader.remove(fqn)
        }
    }

    fn notify(&self, kind: EventKind, fqn: &Fqn, pre: bool, data: Option<crate::tree::NodeData>) -> Result<()> {
        self.notifier.notify_with(kind, || match kind {
            EventKind::NodeActivated => CacheEvent::node_activated(fqn.clone(), pre),
            _ => CacheEvent::node_loaded(fqn.clone(), pre, data),
        })
    }

    /// With passivation the store is only written on eviction, so removals
    /// must reach it explicitly
    fn remove_activated(&self, ctx: &InvocationContext, command: &Command) -> Result<()> {
        match command {
            Command::RemoveNode { fqn } if !ctx.is_in_transaction() => self.loader.remove(fqn),
            Command::Commit { .. } => {
                let removed: Vec<Fqn> = ctx
                    .tx_context()
                    .map(|context| {
                        context
                            .lock()
                            .modifications
                            .iter()
                            .filter_map(|m| match m {
                                crate::commands::ReplicableCommand::RemoveNode { fqn } => Some(fqn.clone()),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                for fqn in removed {
                    debug!(fqn = %fqn, "removing committed removal from store");
                    self.loader.remove(&fqn)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Interceptor for CacheLoaderInterceptor {
    fn name(&self) -> &str {
        if self.activation {
            "ActivationInterceptor"
        } else {
            "CacheLoaderInterceptor"
        }
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        if !ctx.options().skip_cache_loading {
            match command {
                Command::Get { fqn, .. }
                | Command::GetData { fqn }
                | Command::GetKeys { fqn }
                | Command::Exists { fqn }
                | Command::Put { fqn, erase: false, .. }
                | Command::PutKeyValue { fqn, .. }
                | Command::PutForExternalRead { fqn, .. }
                | Command::RemoveKey { fqn, .. }
                | Command::RemoveNode { fqn }
                | Command::ClearData { fqn } => self.load(fqn, false)?,
                Command::GetChildrenNames { fqn } | Command::GetNode { fqn } => self.load(fqn, true)?,
                Command::Move { from, to_parent } => {
                    self.load_subtree(from)?;
                    self.load(to_parent, false)?;
                }
                _ => {}
            }
        }

        let result = next.invoke(ctx, command)?;
        if self.activation {
            self.remove_activated(ctx, command)?;
        }
        Ok(result)
    }
}
