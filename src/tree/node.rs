//! Tree Nodes
//!
//! A [`Node`] is the mutable record stored at one tree position: a key/value
//! map, the names of its direct children and its state flags. Every node
//! lives in a [`TreeNode`] slot owned by the data container; the slot also
//! carries the node's pessimistic lock.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::fqn::{Fqn, FqnElement};
use crate::lock::IdentityLock;

/// Value type stored in nodes
pub type Value = serde_json::Value;

/// Key/value map held by a node
pub type NodeData = BTreeMap<String, Value>;

/// Mutable node record
#[derive(Debug, Clone)]
pub struct Node {
    data: NodeData,
    children: BTreeSet<FqnElement>,
    valid: bool,
    deleted: bool,
    resident: bool,
    data_loaded: bool,
    version: u64,
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl Node {
    /// Empty, valid node whose data has not been loaded yet
    pub fn new() -> Self {
        Self {
            data: NodeData::new(),
            children: BTreeSet::new(),
            valid: true,
            deleted: false,
            resident: false,
            data_loaded: false,
            version: 0,
        }
    }

    // ----- data -----

    pub fn data(&self) -> &NodeData {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.data.keys().cloned().collect()
    }

    /// Insert a single entry, returning the previous value
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.version += 1;
        self.data.insert(key.into(), value)
    }

    /// Merge `data` into this node
    pub fn put_all(&mut self, data: NodeData) {
        self.version += 1;
        self.data.extend(data);
    }

    /// Replace all data
    pub fn replace_all(&mut self, data: NodeData) -> NodeData {
        self.version += 1;
        std::mem::replace(&mut self.data, data)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    /// Clear all data, returning what was there
    pub fn clear_data(&mut self) -> NodeData {
        self.version += 1;
        std::mem::take(&mut self.data)
    }

    /// Monotonic data version (bumped on every data change)
    pub fn version(&self) -> u64 {
        self.version
    }

    // ----- children -----

    pub fn children(&self) -> &BTreeSet<FqnElement> {
        &self.children
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn add_child(&mut self, name: FqnElement) -> bool {
        self.children.insert(name)
    }

    pub fn remove_child(&mut self, name: &FqnElement) -> bool {
        self.children.remove(name)
    }

    pub(crate) fn take_children(&mut self) -> BTreeSet<FqnElement> {
        std::mem::take(&mut self.children)
    }

    // ----- flags -----

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub fn set_resident(&mut self, resident: bool) {
        self.resident = resident;
    }

    pub fn is_data_loaded(&self) -> bool {
        self.data_loaded
    }

    pub fn set_data_loaded(&mut self, loaded: bool) {
        self.data_loaded = loaded;
    }
}

/// Arena slot: one node plus its pessimistic lock
#[derive(Debug)]
pub struct TreeNode {
    fqn: Fqn,
    state: RwLock<Node>,
    lock: IdentityLock,
}

impl TreeNode {
    /// New slot holding an empty node
    pub fn new(fqn: Fqn) -> Self {
        Self::with_node(fqn, Node::new())
    }

    /// New slot holding `node`
    pub fn with_node(fqn: Fqn, node: Node) -> Self {
        Self {
            fqn,
            state: RwLock::new(node),
            lock: IdentityLock::new(),
        }
    }

    pub fn fqn(&self) -> &Fqn {
        &self.fqn
    }

    /// Short-lived read access to the node record
    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.state.read()
    }

    /// Short-lived write access to the node record
    pub fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.state.write()
    }

    /// The node's pessimistic lock
    pub fn lock(&self) -> &IdentityLock {
        &self.lock
    }

    pub fn is_valid(&self) -> bool {
        self.state.read().is_valid()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.read().is_deleted()
    }

    pub fn is_resident(&self) -> bool {
        self.state.read().is_resident()
    }

    /// Fqns of the direct children
    pub fn child_fqns(&self) -> Vec<Fqn> {
        self.state
            .read()
            .children()
            .iter()
            .map(|name| self.fqn.child(name.clone()))
            .collect()
    }

    /// Immutable copy of the node for callers outside the cache
    pub fn snapshot(&self) -> NodeSnapshot {
        let node = self.state.read();
        NodeSnapshot {
            fqn: self.fqn.clone(),
            data: node.data().clone(),
            children: node.children().clone(),
            resident: node.is_resident(),
            version: node.version(),
        }
    }
}

/// Read-only view of a node at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub fqn: Fqn,
    pub data: NodeData,
    pub children: BTreeSet<FqnElement>,
    pub resident: bool,
    pub version: u64,
}

impl NodeSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn child_fqns(&self) -> Vec<Fqn> {
        self.children
            .iter()
            .map(|name| self.fqn.child(name.clone()))
            .collect()
    }
}

impl fmt::Display for NodeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.fqn, self.data)
    }
}

// =============================================================================
// Tests
// =============================================================================
