//! Domain Ports (Port/Adapter Pattern)
//!
//! The cache core depends on its collaborators only through these traits.
//! Reference adapters live in [`crate::adapters`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Cache Core                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ CacheLoader │ Transport │ EvictionPolicy │ Listener │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                              │
//! │  InMemoryCacheLoader │ InMemoryTransport │ FifoEviction...  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::events::CacheEvent;
use crate::commands::ReplicableCommand;
use crate::error::Result;
use crate::fqn::{Fqn, FqnElement};
use crate::transaction::{Address, GlobalTransaction};
use crate::tree::{NodeData, Value};

// =============================================================================
// Persistence
// =============================================================================

/// A change applied to a cache loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Modification {
    PutData { fqn: Fqn, data: NodeData, erase: bool },
    PutKeyValue { fqn: Fqn, key: String, value: Value },
    RemoveNode { fqn: Fqn },
    RemoveKey { fqn: Fqn, key: String },
    RemoveData { fqn: Fqn },
    Move { from: Fqn, to_parent: Fqn },
}

/// Persistence collaborator
///
/// Paths stored in a loader behave like the cache tree: removing a node
/// removes its whole subtree, and storing a node makes it visible under
/// its parent.
pub trait CacheLoader: Send + Sync {
    /// Stored data for `fqn`
    fn get(&self, fqn: &Fqn) -> Result<Option<NodeData>>;

    fn exists(&self, fqn: &Fqn) -> Result<bool>;

    /// Names of the stored children of `fqn`
    fn get_children_names(&self, fqn: &Fqn) -> Result<Option<BTreeSet<FqnElement>>>;

    /// Merge `data` into the stored node, creating it if needed
    fn put(&self, fqn: &Fqn, data: &NodeData) -> Result<()>;

    fn put_key(&self, fqn: &Fqn, key: &str, value: &Value) -> Result<Option<Value>>;

    /// Remove the stored subtree at `fqn`
    fn remove(&self, fqn: &Fqn) -> Result<()>;

    fn remove_key(&self, fqn: &Fqn, key: &str) -> Result<Option<Value>>;

    /// Clear the stored data but keep the node
    fn remove_data(&self, fqn: &Fqn) -> Result<()>;

    /// Apply `modifications` in order
    fn apply(&self, modifications: &[Modification]) -> Result<()> {
        for modification in modifications {
            match modification {
                Modification::PutData { fqn, data, erase } => {
                    if *erase {
                        self.remove_data(fqn)?;
                    }
                    self.put(fqn, data)?;
                }
                Modification::PutKeyValue { fqn, key, value } => {
                    self.put_key(fqn, key, value)?;
                }
                Modification::RemoveNode { fqn } => self.remove(fqn)?,
                Modification::RemoveKey { fqn, key } => {
                    self.remove_key(fqn, key)?;
                }
                Modification::RemoveData { fqn } => self.remove_data(fqn)?,
                Modification::Move { from, to_parent } => self.move_subtree(from, to_parent)?,
            }
        }
        Ok(())
    }

    /// Relocate a stored subtree
    fn move_subtree(&self, from: &Fqn, to_parent: &Fqn) -> Result<()> {
        let Some(name) = from.last_element() else { return Ok(()) };
        let to = to_parent.child(name.clone());
        let mut pending = vec![from.clone()];
        while let Some(current) = pending.pop() {
            if let Some(data) = self.get(&current)? {
                self.put(&current.replace_ancestor(from, &to), &data)?;
            }
            if let Some(children) = self.get_children_names(&current)? {
                pending.extend(children.into_iter().map(|child| current.child(child)));
            }
        }
        self.remove(from)
    }

    /// Stage `modifications` for `gtx`; applied immediately when `one_phase`
    fn prepare(&self, gtx: &GlobalTransaction, modifications: &[Modification], one_phase: bool) -> Result<()>;

    /// Apply what was staged for `gtx`
    fn commit(&self, gtx: &GlobalTransaction) -> Result<()>;

    /// Discard what was staged for `gtx`
    fn rollback(&self, gtx: &GlobalTransaction);
}

// =============================================================================
// Replication
// =============================================================================

/// Delivery guarantee for a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Wait for every member to apply the command
    Sync,
    /// Hand off and return
    Async,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Sync => write!(f, "sync"),
            DeliveryMode::Async => write!(f, "async"),
        }
    }
}

/// Receiver side of a transport
pub trait RemoteCommandHandler: Send + Sync {
    /// Apply a command sent by `origin`
    fn handle_remote(&self, origin: Address, command: ReplicableCommand) -> Result<()>;
}

/// Group communication collaborator
pub trait Transport: Send + Sync {
    /// Join the group; received commands go to `handler`
    fn start(&self, handler: Weak<dyn RemoteCommandHandler>) -> Result<()>;

    /// Leave the group
    fn stop(&self);

    fn local_address(&self) -> Address;

    /// Current members, including this one
    fn members(&self) -> Vec<Address>;

    /// Send `command` to every other member
    ///
    /// Failures surface as [`crate::Error::Replication`].
    fn broadcast(&self, command: &ReplicableCommand, mode: DeliveryMode, timeout: Duration) -> Result<()>;
}

// =============================================================================
// Eviction
// =============================================================================

/// Node activity reported to eviction policies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionEvent {
    Added(Fqn),
    Visited(Fqn),
    Removed(Fqn),
}

impl EvictionEvent {
    pub fn fqn(&self) -> &Fqn {
        match self {
            EvictionEvent::Added(fqn) | EvictionEvent::Visited(fqn) | EvictionEvent::Removed(fqn) => fqn,
        }
    }
}

/// Decides which nodes to evict
pub trait EvictionPolicy: Send {
    fn name(&self) -> &str;

    /// Record node activity
    fn on_event(&mut self, event: &EvictionEvent);

    /// Nodes to evict now; selected nodes are forgotten by the policy
    fn select_victims(&mut self) -> Vec<Fqn>;

    /// Nodes currently tracked
    fn tracked(&self) -> usize;
}

// =============================================================================
// Notification
// =============================================================================

/// Event handler
///
/// An error returned for a pre-phase node event vetoes the operation.
pub trait CacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent) -> anyhow::Result<()>;
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) -> anyhow::Result<()> {
        self(event)
    }
}
