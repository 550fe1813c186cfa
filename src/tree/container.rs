//! Data Container
//!
//! Owns every node of the tree. Nodes live in an arena keyed by [`Fqn`];
//! the parent/child relationship is kept in each node's child-name set.
//! Handles returned to callers are `Arc<TreeNode>` views into the arena:
//! once a node is structurally removed it is marked invalid, so a stale
//! handle can never be mistaken for a live node.
//!
//! # Concurrency
//!
//! The arena is a `DashMap`, and each node record has its own short-lived
//! `RwLock`. Neither guard is ever held while acquiring the other. Callers
//! are expected to hold the appropriate cache lock on the path before
//! mutating; the container itself only guarantees structural integrity of
//! the child sets (concurrent inserts under one parent never lose a child).

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::node::{NodeData, TreeNode};
use crate::fqn::{Fqn, FqnElement};

/// Result of [`DataContainer::create_nodes`]
#[derive(Debug)]
pub struct CreatedNodes {
    /// Nodes that did not exist before the call, root-to-leaf
    pub created: Vec<Arc<TreeNode>>,
    /// The node at the requested path
    pub target: Arc<TreeNode>,
}

/// Owner of the node tree
pub struct DataContainer {
    nodes: DashMap<Fqn, Arc<TreeNode>>,
    root: Arc<TreeNode>,
    started: AtomicBool,
}

impl Default for DataContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataContainer {
    /// Container holding only the root node
    pub fn new() -> Self {
        let root = Arc::new(TreeNode::new(Fqn::root()));
        let nodes = DashMap::new();
        nodes.insert(Fqn::root(), Arc::clone(&root));
        Self {
            nodes,
            root,
            started: AtomicBool::new(false),
        }
    }

    /// Mark the container usable
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Mark the container unusable (data is kept)
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The root node
    pub fn root(&self) -> Arc<TreeNode> {
        Arc::clone(&self.root)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Look up the node at `fqn`
    ///
    /// Nodes marked invalid or deleted are hidden unless the matching flag
    /// asks to see through them.
    pub fn peek(&self, fqn: &Fqn, include_invalid: bool, include_deleted: bool) -> Option<Arc<TreeNode>> {
        let node = self.nodes.get(fqn).map(|entry| Arc::clone(entry.value()))?;
        {
            let state = node.read();
            if !include_invalid && !state.is_valid() {
                return None;
            }
            if !include_deleted && state.is_deleted() {
                return None;
            }
        }
        Some(node)
    }

    /// Strict lookup: valid, not deleted
    pub fn peek_strict(&self, fqn: &Fqn) -> Option<Arc<TreeNode>> {
        self.peek(fqn, false, false)
    }

    /// True if the node is visible and every ancestor is valid
    pub fn exists(&self, fqn: &Fqn) -> bool {
        if self.peek_strict(fqn).is_none() {
            return false;
        }
        (0..fqn.size()).all(|generation| {
            fqn.ancestor(generation)
                .ok()
                .and_then(|ancestor| self.peek(&ancestor, true, true))
                .map(|node| node.is_valid())
                .unwrap_or(false)
        })
    }

    /// Child names of the node at `fqn`
    pub fn children_names(&self, fqn: &Fqn) -> Option<BTreeSet<FqnElement>> {
        self.peek_strict(fqn).map(|node| node.read().children().clone())
    }

    /// The node and all its descendants in pre-order
    pub fn subtree(&self, fqn: &Fqn) -> Vec<Arc<TreeNode>> {
        let mut out = Vec::new();
        if let Some(node) = self.peek(fqn, true, true) {
            self.collect_subtree(node, &mut out);
        }
        out
    }

    fn collect_subtree(&self, node: Arc<TreeNode>, out: &mut Vec<Arc<TreeNode>>) {
        let children = node.child_fqns();
        out.push(node);
        for child in children {
            if let Some(child_node) = self.peek(&child, true, true) {
                self.collect_subtree(child_node, out);
            }
        }
    }

    // =========================================================================
    // Structural mutation
    // =========================================================================

    /// Create every missing node from the root down to `fqn`
    ///
    /// Existing nodes along the path are reused, including tombstoned ones.
    pub fn create_nodes(&self, fqn: &Fqn) -> CreatedNodes {
        let mut created = Vec::new();
        let mut parent = Arc::clone(&self.root);

        for generation in 1..=fqn.size() {
            let sub = if generation == fqn.size() {
                fqn.clone()
            } else {
                Fqn::from_elements(fqn.elements()[..generation].iter().cloned())
            };

            let mut fresh = false;
            let node = Arc::clone(
                self.nodes
                    .entry(sub.clone())
                    .or_insert_with(|| {
                        fresh = true;
                        Arc::new(TreeNode::new(sub.clone()))
                    })
                    .value(),
            );

            if let Some(name) = sub.last_element() {
                parent.write().add_child(name.clone());
            }
            if fresh {
                trace!(fqn = %sub, "created node");
                created.push(Arc::clone(&node));
            }
            parent = node;
        }

        CreatedNodes {
            created,
            target: parent,
        }
    }

    /// Physically unlink the subtree rooted at `fqn`
    ///
    /// Unless `skip_marker_check`, the target must be tombstoned. Every
    /// removed node is marked invalid; for the root only its children are
    /// excised and the root itself stays valid.
    pub fn remove_from_data_structure(&self, fqn: &Fqn, skip_marker_check: bool) -> bool {
        let node = match self.peek(fqn, false, true) {
            Some(node) => node,
            None => return false,
        };
        if !skip_marker_check && !node.is_deleted() {
            return false;
        }

        if fqn.is_root() {
            let children = node.write().take_children();
            for name in children {
                self.unlink_subtree(&fqn.child(name));
            }
            node.write().set_deleted(false);
            return true;
        }

        if let (Some(parent), Some(name)) = (self.peek(&fqn.parent(), true, true), fqn.last_element()) {
            parent.write().remove_child(name);
        }
        self.unlink_subtree(fqn);
        true
    }

    fn unlink_subtree(&self, fqn: &Fqn) {
        for node in self.subtree(fqn) {
            self.nodes.remove(node.fqn());
            node.write().set_valid(false);
            trace!(fqn = %node.fqn(), "removed node");
        }
    }

    /// Evict the node at `fqn`
    ///
    /// Leaves are removed entirely (true). Nodes with children keep their
    /// place as empty structural placeholders (false).
    pub fn evict(&self, fqn: &Fqn) -> bool {
        let node = match self.peek(fqn, false, true) {
            Some(node) => node,
            None => return true,
        };
        if fqn.is_root() || node.read().has_children() {
            let mut state = node.write();
            state.clear_data();
            state.set_data_loaded(false);
            return false;
        }
        self.remove_from_data_structure(fqn, true)
    }

    /// Paths eligible for eviction under `fqn`
    ///
    /// Root: its direct children (all descendants when `recursive`).
    /// Otherwise: the path itself, plus descendants in pre-order when
    /// `recursive`. Resident nodes are excluded; missing paths yield nothing.
    pub fn nodes_for_eviction(&self, fqn: &Fqn, recursive: bool) -> Vec<Fqn> {
        let node = match self.peek_strict(fqn) {
            Some(node) => node,
            None => return Vec::new(),
        };

        let candidates: Vec<Arc<TreeNode>> = match (fqn.is_root(), recursive) {
            (true, false) => node
                .child_fqns()
                .iter()
                .filter_map(|child| self.peek_strict(child))
                .collect(),
            (true, true) => self.subtree(fqn).into_iter().skip(1).collect(),
            (false, false) => vec![node],
            (false, true) => self.subtree(fqn),
        };

        candidates
            .into_iter()
            .filter(|n| {
                let state = n.read();
                state.is_valid() && !state.is_deleted() && !state.is_resident()
            })
            .map(|n| n.fqn().clone())
            .collect()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Node count including the root, or -1 before the container is started
    pub fn number_of_nodes(&self) -> i64 {
        if !self.is_started() {
            return -1;
        }
        self.nodes.len() as i64
    }

    /// Number of attributes stored at `fqn`
    pub fn number_of_attributes(&self, fqn: &Fqn) -> usize {
        self.peek_strict(fqn)
            .map(|node| node.read().data().len())
            .unwrap_or(0)
    }

    /// Number of attributes across the whole tree
    pub fn total_attributes(&self) -> usize {
        self.nodes
            .iter()
            .map(|entry| entry.value().read().data().len())
            .sum()
    }

    /// Every live node slot
    pub fn all_nodes(&self) -> Vec<Arc<TreeNode>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of nodes whose pessimistic lock is held
    pub fn locked_node_count(&self) -> usize {
        self.all_nodes()
            .iter()
            .filter(|node| node.lock().is_locked())
            .count()
    }

    /// Data stored at `fqn`
    pub fn data(&self, fqn: &Fqn) -> Option<NodeData> {
        self.peek_strict(fqn).map(|node| node.read().data().clone())
    }

    /// Drop every node except the root and clear the root's data
    pub fn clear(&self) {
        self.remove_from_data_structure(&Fqn::root(), true);
        self.root.write().clear_data();
    }

    /// Indented dump of the tree
    pub fn print_details(&self) -> String {
        let mut out = String::new();
        for node in self.subtree(&Fqn::root()) {
            let state = node.read();
            let indent = "  ".repeat(node.fqn().size());
            let _ = writeln!(
                out,
                "{}{} {:?}",
                indent,
                if node.fqn().is_root() {
                    "/".to_string()
                } else {
                    node.fqn().last_element_as_string()
                },
                state.data()
            );
        }
        out
    }
}

impl std::fmt::Debug for DataContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContainer")
            .field("nodes", &self.nodes.len())
            .field("started", &self.is_started())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
