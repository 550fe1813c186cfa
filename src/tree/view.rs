//! Data Views
//!
//! [`DataView`] is the read/write surface the terminal interceptor performs
//! commands against. [`DirectView`] is the pessimistic rendition: nodes are
//! mutated in place under their write locks, and inside a transaction every
//! change is preceded by an [`UndoEntry`] so rollback can restore it.
//!
//! Transactional removal only tombstones the subtree; the commit purges it.
//! Writing under a tombstone undeletes the lineage with cleared data, which
//! makes delete-then-recreate inside one transaction behave as expected.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;

use super::container::DataContainer;
use super::node::{NodeData, NodeSnapshot, TreeNode, Value};
use crate::error::{Error, Result};
use crate::fqn::{Fqn, FqnElement};
use crate::transaction::TransactionContext;

/// Read/write surface over the tree
pub trait DataView {
    /// Data at `fqn`, `None` if the node is not visible
    fn data(&mut self, fqn: &Fqn) -> Option<NodeData>;

    /// Names of the visible children of `fqn`
    fn children_names(&mut self, fqn: &Fqn) -> Option<BTreeSet<FqnElement>>;

    /// Detached copy of the node
    fn snapshot(&mut self, fqn: &Fqn) -> Option<NodeSnapshot>;

    /// Merge (or replace, when `erase`) the data at `fqn`, creating the
    /// node and its ancestors as needed; returns the prior data
    fn put(&mut self, fqn: &Fqn, data: NodeData, erase: bool) -> NodeData;

    fn put_key(&mut self, fqn: &Fqn, key: &str, value: Value) -> Option<Value>;

    fn remove_key(&mut self, fqn: &Fqn, key: &str) -> Option<Value>;

    /// Clear the data at `fqn`; false if the node is not visible
    fn clear_data(&mut self, fqn: &Fqn) -> bool;

    /// Remove the subtree at `fqn`; false if the node is not visible
    fn remove_node(&mut self, fqn: &Fqn) -> bool;

    fn exists(&mut self, fqn: &Fqn) -> bool {
        self.data(fqn).is_some()
    }

    fn get(&mut self, fqn: &Fqn, key: &str) -> Option<Value> {
        self.data(fqn).and_then(|mut data| data.remove(key))
    }

    fn keys(&mut self, fqn: &Fqn) -> Option<BTreeSet<String>> {
        self.data(fqn).map(|data| data.into_keys().collect())
    }

    /// Data of the subtree at `fqn` in pre-order
    fn subtree_data(&mut self, fqn: &Fqn) -> Vec<(Fqn, NodeData)> {
        let mut out = Vec::new();
        let mut pending = vec![fqn.clone()];
        while let Some(current) = pending.pop() {
            let Some(data) = self.data(&current) else { continue };
            if let Some(children) = self.children_names(&current) {
                pending.extend(children.into_iter().rev().map(|name| current.child(name)));
            }
            out.push((current, data));
        }
        out
    }

    /// Move the subtree at `from` under `new_parent`; returns its new Fqn
    fn move_node(&mut self, from: &Fqn, new_parent: &Fqn) -> Result<Fqn> {
        if from.is_root() {
            return Err(Error::InvalidArgument("cannot move the root node".to_string()));
        }
        if new_parent.is_child_or_equals(from) {
            return Err(Error::InvalidArgument(format!(
                "cannot move {} under its own subtree {}",
                from, new_parent
            )));
        }
        if !self.exists(from) {
            return Err(Error::NodeNotFound(from.clone()));
        }
        if !self.exists(new_parent) {
            return Err(Error::NodeNotFound(new_parent.clone()));
        }

        let to = match from.last_element() {
            Some(name) => new_parent.child(name.clone()),
            None => return Err(Error::InvalidArgument("cannot move the root node".to_string())),
        };
        let subtree = self.subtree_data(from);
        self.remove_node(from);
        for (fqn, data) in subtree {
            self.put(&fqn.replace_ancestor(from, &to), data, true);
        }
        Ok(to)
    }
}

// =============================================================================
// Undo Log
// =============================================================================

/// Prior state of one node
#[derive(Debug, Clone)]
pub struct UndoEntry {
    node: Arc<TreeNode>,
    data: NodeData,
    deleted: bool,
    data_loaded: bool,
}

impl UndoEntry {
    /// Capture the node's current state
    pub fn capture(node: &Arc<TreeNode>) -> Self {
        let state = node.read();
        Self {
            node: Arc::clone(node),
            data: state.data().clone(),
            deleted: state.is_deleted(),
            data_loaded: state.is_data_loaded(),
        }
    }

    pub fn fqn(&self) -> &Fqn {
        self.node.fqn()
    }

    /// Put the captured state back
    pub fn restore(self) {
        let mut state = self.node.write();
        state.replace_all(self.data);
        state.set_deleted(self.deleted);
        state.set_data_loaded(self.data_loaded);
    }
}

// =============================================================================
// Direct View
// =============================================================================

/// In-place view used by the pessimistic scheme
pub struct DirectView<'a> {
    container: &'a DataContainer,
    tx: Option<&'a mut TransactionContext>,
}

impl<'a> DirectView<'a> {
    pub fn new(container: &'a DataContainer, tx: Option<&'a mut TransactionContext>) -> Self {
        Self { container, tx }
    }

    fn remember(&mut self, node: &Arc<TreeNode>) {
        if let Some(tx) = self.tx.as_deref_mut() {
            tx.undo.push(UndoEntry::capture(node));
        }
    }

    /// Node at `fqn` ready for mutation: created if missing, and with any
    /// tombstoned node on its lineage undeleted and emptied
    fn writable(&mut self, fqn: &Fqn) -> Arc<TreeNode> {
        let node = match self.container.peek(fqn, false, true) {
            Some(node) => node,
            None => {
                let result = self.container.create_nodes(fqn);
                result.target.write().set_data_loaded(true);
                if let Some(tx) = self.tx.as_deref_mut() {
                    tx.created.extend(result.created);
                }
                result.target
            }
        };

        for ancestor in fqn.lineage() {
            let Some(current) = self.container.peek(&ancestor, false, true) else { continue };
            if current.is_deleted() {
                self.remember(&current);
                let mut state = current.write();
                state.clear_data();
                state.set_deleted(false);
                trace!(fqn = %ancestor, "undeleted tombstoned node");
            }
        }
        node
    }

    fn visible(&self, fqn: &Fqn) -> Option<Arc<TreeNode>> {
        self.container.peek_strict(fqn)
    }

    fn visible_children(&self, node: &TreeNode) -> BTreeSet<FqnElement> {
        node.child_fqns()
            .into_iter()
            .filter(|child| self.container.peek_strict(child).is_some())
            .filter_map(|child| child.last_element().cloned())
            .collect()
    }

    fn tombstone(&mut self, fqn: &Fqn) {
        for node in self.container.subtree(fqn) {
            if node.is_deleted() {
                continue;
            }
            self.remember(&node);
            node.write().set_deleted(true);
        }
        if let Some(tx) = self.tx.as_deref_mut() {
            tx.removed.push(fqn.clone());
        }
    }
}

impl DataView for DirectView<'_> {
    fn data(&mut self, fqn: &Fqn) -> Option<NodeData> {
        self.visible(fqn).map(|node| node.read().data().clone())
    }

    fn children_names(&mut self, fqn: &Fqn) -> Option<BTreeSet<FqnElement>> {
        self.visible(fqn).map(|node| self.visible_children(&node))
    }

    fn snapshot(&mut self, fqn: &Fqn) -> Option<NodeSnapshot> {
        let node = self.visible(fqn)?;
        let mut snapshot = node.snapshot();
        snapshot.children = self.visible_children(&node);
        Some(snapshot)
    }

    fn put(&mut self, fqn: &Fqn, data: NodeData, erase: bool) -> NodeData {
        let node = self.writable(fqn);
        self.remember(&node);
        let mut state = node.write();
        if erase {
            state.set_data_loaded(true);
            state.replace_all(data)
        } else {
            let prior = state.data().clone();
            state.put_all(data);
            prior
        }
    }

    fn put_key(&mut self, fqn: &Fqn, key: &str, value: Value) -> Option<Value> {
        let node = self.writable(fqn);
        self.remember(&node);
        let previous = node.write().put(key, value);
        previous
    }

    fn remove_key(&mut self, fqn: &Fqn, key: &str) -> Option<Value> {
        let node = self.visible(fqn)?;
        if node.read().get(key).is_none() {
            return None;
        }
        self.remember(&node);
        let removed = node.write().remove(key);
        removed
    }

    fn clear_data(&mut self, fqn: &Fqn) -> bool {
        let Some(node) = self.visible(fqn) else { return false };
        self.remember(&node);
        node.write().clear_data();
        true
    }

    fn remove_node(&mut self, fqn: &Fqn) -> bool {
        let Some(node) = self.visible(fqn) else { return false };

        if fqn.is_root() {
            for child in self.visible_children(&node) {
                self.remove_node(&fqn.child(child));
            }
            self.remember(&node);
            node.write().clear_data();
            return true;
        }

        if self.tx.is_some() {
            self.tombstone(fqn);
            true
        } else {
            self.container.remove_from_data_structure(fqn, true)
        }
    }
}

/// Physically remove whatever is still tombstoned under `fqn`
///
/// Run at commit for every subtree the transaction removed. Nodes that were
/// recreated in the meantime survive; their tombstoned descendants do not.
pub fn purge_tombstones(container: &DataContainer, fqn: &Fqn) {
    let Some(node) = container.peek(fqn, false, true) else { return };
    if node.is_deleted() {
        container.remove_from_data_structure(fqn, false);
        return;
    }
    for child in node.child_fqns() {
        purge_tombstones(container, &child);
    }
}

/// Undo a pessimistic transaction: restore prior states newest first, then
/// remove the nodes it created
pub fn undo_transaction(container: &DataContainer, tx: &mut TransactionContext) {
    for entry in tx.undo.drain(..).rev() {
        entry.restore();
    }
    for node in tx.created.drain(..).rev() {
        if node.is_valid() {
            container.remove_from_data_structure(node.fqn(), true);
        }
    }
    tx.removed.clear();
}

// =============================================================================
// Tests
// =============================================================================
