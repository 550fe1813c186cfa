//! Commands
//!
//! Every cache operation is a [`Command`] threaded through the interceptor
//! chain; the terminal interceptor turns it into a [`CommandResult`].
//! Modifications that must cross the wire (replication, write-through) are
//! expressed as the serde-serializable [`ReplicableCommand`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::ports::Modification;
use crate::fqn::{Fqn, FqnElement};
use crate::transaction::GlobalTransaction;
use crate::tree::{NodeData, NodeSnapshot, Value};

/// A cache operation
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // =========================================================================
    // Writes
    // =========================================================================
    /// Merge (or replace, when `erase`) the data of a node
    Put { fqn: Fqn, data: NodeData, erase: bool },
    PutKeyValue { fqn: Fqn, key: String, value: Value },
    /// Store a value read from an external source; never overwrites
    PutForExternalRead { fqn: Fqn, key: String, value: Value },
    RemoveNode { fqn: Fqn },
    RemoveKey { fqn: Fqn, key: String },
    ClearData { fqn: Fqn },
    Move { from: Fqn, to_parent: Fqn },

    // =========================================================================
    // Reads
    // =========================================================================
    Get { fqn: Fqn, key: String },
    GetData { fqn: Fqn },
    GetKeys { fqn: Fqn },
    GetChildrenNames { fqn: Fqn },
    GetNode { fqn: Fqn },
    Exists { fqn: Fqn },

    // =========================================================================
    // Structural maintenance
    // =========================================================================
    Evict { fqn: Fqn, recursive: bool },
    Invalidate { fqn: Fqn },

    // =========================================================================
    // Transaction boundaries
    // =========================================================================
    Prepare {
        gtx: GlobalTransaction,
        modifications: Vec<ReplicableCommand>,
        one_phase: bool,
    },
    Commit { gtx: GlobalTransaction },
    Rollback { gtx: GlobalTransaction },
}

impl Command {
    /// Short name used in logs and statistics
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::PutKeyValue { .. } => "put_key_value",
            Command::PutForExternalRead { .. } => "put_for_external_read",
            Command::RemoveNode { .. } => "remove_node",
            Command::RemoveKey { .. } => "remove_key",
            Command::ClearData { .. } => "clear_data",
            Command::Move { .. } => "move",
            Command::Get { .. } => "get",
            Command::GetData { .. } => "get_data",
            Command::GetKeys { .. } => "get_keys",
            Command::GetChildrenNames { .. } => "get_children_names",
            Command::GetNode { .. } => "get_node",
            Command::Exists { .. } => "exists",
            Command::Evict { .. } => "evict",
            Command::Invalidate { .. } => "invalidate",
            Command::Prepare { .. } => "prepare",
            Command::Commit { .. } => "commit",
            Command::Rollback { .. } => "rollback",
        }
    }

    /// Primary target of the command
    pub fn fqn(&self) -> Option<&Fqn> {
        match self {
            Command::Put { fqn, .. }
            | Command::PutKeyValue { fqn, .. }
            | Command::PutForExternalRead { fqn, .. }
            | Command::RemoveNode { fqn }
            | Command::RemoveKey { fqn, .. }
            | Command::ClearData { fqn }
            | Command::Get { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::GetChildrenNames { fqn }
            | Command::GetNode { fqn }
            | Command::Exists { fqn }
            | Command::Evict { fqn, .. }
            | Command::Invalidate { fqn } => Some(fqn),
            Command::Move { from, .. } => Some(from),
            Command::Prepare { .. } | Command::Commit { .. } | Command::Rollback { .. } => None,
        }
    }

    /// True for commands that modify node data or structure on behalf of
    /// the application
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Put { .. }
                | Command::PutKeyValue { .. }
                | Command::PutForExternalRead { .. }
                | Command::RemoveNode { .. }
                | Command::RemoveKey { .. }
                | Command::ClearData { .. }
                | Command::Move { .. }
        )
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Command::Get { .. }
                | Command::GetData { .. }
                | Command::GetKeys { .. }
                | Command::GetChildrenNames { .. }
                | Command::GetNode { .. }
                | Command::Exists { .. }
        )
    }

    /// True for writes that may create the target node
    pub fn creates_node(&self) -> bool {
        matches!(
            self,
            Command::Put { .. } | Command::PutKeyValue { .. } | Command::PutForExternalRead { .. }
        )
    }

    /// True for prepare, commit and rollback
    pub fn is_transaction_boundary(&self) -> bool {
        matches!(
            self,
            Command::Prepare { .. } | Command::Commit { .. } | Command::Rollback { .. }
        )
    }

    /// Transaction named by a boundary command
    pub fn boundary_gtx(&self) -> Option<&GlobalTransaction> {
        match self {
            Command::Prepare { gtx, .. } | Command::Commit { gtx } | Command::Rollback { gtx } => Some(gtx),
            _ => None,
        }
    }

    /// Wire form of a write or boundary command
    pub fn to_replicable(&self) -> Option<ReplicableCommand> {
        let replicable = match self.clone() {
            Command::Put { fqn, data, erase } => ReplicableCommand::Put { fqn, data, erase },
            Command::PutKeyValue { fqn, key, value } => ReplicableCommand::PutKeyValue { fqn, key, value },
            Command::PutForExternalRead { fqn, key, value } => {
                ReplicableCommand::PutForExternalRead { fqn, key, value }
            }
            Command::RemoveNode { fqn } => ReplicableCommand::RemoveNode { fqn },
            Command::RemoveKey { fqn, key } => ReplicableCommand::RemoveKey { fqn, key },
            Command::ClearData { fqn } => ReplicableCommand::ClearData { fqn },
            Command::Move { from, to_parent } => ReplicableCommand::Move { from, to_parent },
            Command::Invalidate { fqn } => ReplicableCommand::Invalidate { fqn },
            Command::Prepare {
                gtx,
                modifications,
                one_phase,
            } => ReplicableCommand::Prepare {
                gtx,
                modifications,
                one_phase,
            },
            Command::Commit { gtx } => ReplicableCommand::Commit { gtx },
            Command::Rollback { gtx } => ReplicableCommand::Rollback { gtx },
            _ => return None,
        };
        Some(replicable)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.fqn(), self.boundary_gtx()) {
            (Some(fqn), _) => write!(f, "{}({})", self.name(), fqn),
            (None, Some(gtx)) => write!(f, "{}({})", self.name(), gtx),
            (None, None) => write!(f, "{}", self.name()),
        }
    }
}

/// Result of a command
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CommandResult {
    #[default]
    None,
    Value(Option<Value>),
    Data(Option<NodeData>),
    Keys(Option<BTreeSet<String>>),
    Children(Option<BTreeSet<FqnElement>>),
    Node(Option<NodeSnapshot>),
    Bool(bool),
}

impl CommandResult {
    pub fn into_value(self) -> Option<Value> {
        match self {
            CommandResult::Value(value) => value,
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<NodeData> {
        match self {
            CommandResult::Data(data) => data,
            _ => None,
        }
    }

    pub fn into_keys(self) -> Option<BTreeSet<String>> {
        match self {
            CommandResult::Keys(keys) => keys,
            _ => None,
        }
    }

    pub fn into_children(self) -> Option<BTreeSet<FqnElement>> {
        match self {
            CommandResult::Children(children) => children,
            _ => None,
        }
    }

    pub fn into_node(self) -> Option<NodeSnapshot> {
        match self {
            CommandResult::Node(node) => node,
            _ => None,
        }
    }

    pub fn into_bool(self) -> bool {
        matches!(self, CommandResult::Bool(true))
    }

    /// True if a read found something
    pub fn is_hit(&self) -> bool {
        match self {
            CommandResult::Value(v) => v.is_some(),
            CommandResult::Data(d) => d.is_some(),
            CommandResult::Keys(k) => k.is_some(),
            CommandResult::Children(c) => c.is_some(),
            CommandResult::Node(n) => n.is_some(),
            CommandResult::Bool(b) => *b,
            CommandResult::None => false,
        }
    }
}

/// Wire form of a modification or transaction boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplicableCommand {
    Put { fqn: Fqn, data: NodeData, erase: bool },
    PutKeyValue { fqn: Fqn, key: String, value: Value },
    PutForExternalRead { fqn: Fqn, key: String, value: Value },
    RemoveNode { fqn: Fqn },
    RemoveKey { fqn: Fqn, key: String },
    ClearData { fqn: Fqn },
    Move { from: Fqn, to_parent: Fqn },
    Invalidate { fqn: Fqn },
    Prepare {
        gtx: GlobalTransaction,
        modifications: Vec<ReplicableCommand>,
        one_phase: bool,
    },
    Commit { gtx: GlobalTransaction },
    Rollback { gtx: GlobalTransaction },
    /// Queued asynchronous commands delivered together
    Batch { commands: Vec<ReplicableCommand> },
}

impl ReplicableCommand {
    /// Executable form; `None` for batches
    pub fn into_command(self) -> Option<Command> {
        let command = match self {
            ReplicableCommand::Put { fqn, data, erase } => Command::Put { fqn, data, erase },
            ReplicableCommand::PutKeyValue { fqn, key, value } => Command::PutKeyValue { fqn, key, value },
            ReplicableCommand::PutForExternalRead { fqn, key, value } => {
                Command::PutForExternalRead { fqn, key, value }
            }
            ReplicableCommand::RemoveNode { fqn } => Command::RemoveNode { fqn },
            ReplicableCommand::RemoveKey { fqn, key } => Command::RemoveKey { fqn, key },
            ReplicableCommand::ClearData { fqn } => Command::ClearData { fqn },
            ReplicableCommand::Move { from, to_parent } => Command::Move { from, to_parent },
            ReplicableCommand::Invalidate { fqn } => Command::Invalidate { fqn },
            ReplicableCommand::Prepare {
                gtx,
                modifications,
                one_phase,
            } => Command::Prepare {
                gtx,
                modifications,
                one_phase,
            },
            ReplicableCommand::Commit { gtx } => Command::Commit { gtx },
            ReplicableCommand::Rollback { gtx } => Command::Rollback { gtx },
            ReplicableCommand::Batch { .. } => return None,
        };
        Some(command)
    }

    /// Fqn touched by a data modification
    pub fn fqn(&self) -> Option<&Fqn> {
        match self {
            ReplicableCommand::Put { fqn, .. }
            | ReplicableCommand::PutKeyValue { fqn, .. }
            | ReplicableCommand::PutForExternalRead { fqn, .. }
            | ReplicableCommand::RemoveNode { fqn }
            | ReplicableCommand::RemoveKey { fqn, .. }
            | ReplicableCommand::ClearData { fqn }
            | ReplicableCommand::Invalidate { fqn } => Some(fqn),
            ReplicableCommand::Move { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Store-side form for cache loaders
    pub fn to_modification(&self) -> Option<Modification> {
        let modification = match self.clone() {
            ReplicableCommand::Put { fqn, data, erase } => Modification::PutData { fqn, data, erase },
            ReplicableCommand::PutKeyValue { fqn, key, value }
            | ReplicableCommand::PutForExternalRead { fqn, key, value } => {
                Modification::PutKeyValue { fqn, key, value }
            }
            ReplicableCommand::RemoveNode { fqn } => Modification::RemoveNode { fqn },
            ReplicableCommand::RemoveKey { fqn, key } => Modification::RemoveKey { fqn, key },
            ReplicableCommand::ClearData { fqn } => Modification::RemoveData { fqn },
            ReplicableCommand::Move { from, to_parent } => Modification::Move { from, to_parent },
            _ => return None,
        };
        Some(modification)
    }
}

// =============================================================================
// Tests
// =============================================================================
