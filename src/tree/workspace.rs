//! MVCC Working Copies
//!
//! Writers never touch committed nodes. Each invocation (or transaction)
//! keeps a [`Workspace`] of [`WorkingNode`] copies keyed by Fqn; readers see
//! the committed tree plus their own copies. At commit the workspace is
//! applied while the write locks are still held: removals first, shallow
//! first, then creations and updates, shallow first.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use super::container::DataContainer;
use super::node::{NodeData, NodeSnapshot, TreeNode, Value};
use super::view::DataView;
use crate::error::{Error, Result};
use crate::fqn::{Fqn, FqnElement};

/// Private copy of one node
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingNode {
    pub data: NodeData,
    /// Version of the committed node when copied
    pub version: u64,
    /// Copied from a committed node
    pub original: bool,
    /// Did not exist in the committed tree
    pub created: bool,
    /// Removed in this workspace
    pub deleted: bool,
    /// Removed and then written again
    pub recreated: bool,
    /// Data differs from the copy source
    pub changed: bool,
}

impl WorkingNode {
    fn copy_of(node: &TreeNode) -> Self {
        let state = node.read();
        Self {
            data: state.data().clone(),
            version: state.version(),
            original: true,
            created: false,
            deleted: false,
            recreated: false,
            changed: false,
        }
    }

    fn fresh() -> Self {
        Self {
            data: NodeData::new(),
            version: 0,
            original: false,
            created: true,
            deleted: false,
            recreated: false,
            changed: false,
        }
    }
}

/// Working copies of one invocation or transaction
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    nodes: BTreeMap<Fqn, WorkingNode>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, fqn: &Fqn) -> Option<&WorkingNode> {
        self.nodes.get(fqn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fqn, &WorkingNode)> {
        self.nodes.iter()
    }

    /// Fqns this workspace will write at commit
    pub fn modified(&self) -> Vec<Fqn> {
        self.nodes
            .iter()
            .filter(|(_, copy)| copy.changed || copy.deleted || copy.recreated)
            .map(|(fqn, _)| fqn.clone())
            .collect()
    }

    /// Fail if a copy being written was based on a version that has since
    /// been committed over
    pub fn check_write_skew(&self, container: &DataContainer) -> Result<()> {
        for (fqn, copy) in &self.nodes {
            if !(copy.original && copy.changed) {
                continue;
            }
            let current = container.peek(fqn, false, true).map(|node| node.read().version());
            if current != Some(copy.version) {
                return Err(Error::InvalidState(format!(
                    "write skew detected on {}: read version {}, committed {:?}",
                    fqn, copy.version, current
                )));
            }
        }
        Ok(())
    }

    /// Apply every copy to the committed tree
    pub fn apply(self, container: &DataContainer) {
        for (fqn, copy) in &self.nodes {
            if copy.original && (copy.deleted || copy.recreated) {
                container.remove_from_data_structure(fqn, true);
                trace!(fqn = %fqn, "committed removal");
            }
        }
        for (fqn, copy) in self.nodes {
            if copy.deleted || !(copy.created || copy.recreated || copy.changed) {
                continue;
            }
            let node = container.create_nodes(&fqn).target;
            if copy.changed || copy.recreated {
                let mut state = node.write();
                state.replace_all(copy.data);
                state.set_data_loaded(true);
            }
            trace!(fqn = %fqn, "committed write");
        }
    }
}

// =============================================================================
// Workspace View
// =============================================================================

/// Copy-on-write view used by the MVCC scheme
pub struct WorkspaceView<'a> {
    container: &'a DataContainer,
    workspace: &'a mut Workspace,
    repeatable_read: bool,
}

impl<'a> WorkspaceView<'a> {
    /// View over `container` and `workspace`; with `repeatable_read` the
    /// first read of a node pins its committed state for the workspace
    pub fn new(container: &'a DataContainer, workspace: &'a mut Workspace, repeatable_read: bool) -> Self {
        Self {
            container,
            workspace,
            repeatable_read,
        }
    }

    /// True if an ancestor was removed or recreated here, hiding the
    /// committed node at `fqn`
    fn shadowed(&self, fqn: &Fqn) -> bool {
        (0..fqn.size()).any(|generation| {
            fqn.ancestor(generation)
                .ok()
                .and_then(|ancestor| self.workspace.nodes.get(&ancestor))
                .map(|copy| copy.deleted || copy.recreated)
                .unwrap_or(false)
        })
    }

    fn committed(&self, fqn: &Fqn) -> Option<Arc<TreeNode>> {
        if self.shadowed(fqn) {
            return None;
        }
        self.container.peek_strict(fqn)
    }

    fn is_visible(&self, fqn: &Fqn) -> bool {
        match self.workspace.nodes.get(fqn) {
            Some(copy) => !copy.deleted,
            None => self.committed(fqn).is_some(),
        }
    }

    /// Working copy for a write, creating the node (and any missing or
    /// removed ancestors) when `create`
    fn copy_for_write(&mut self, fqn: &Fqn, create: bool) -> Option<&mut WorkingNode> {
        if create && !fqn.is_root() {
            let parent = fqn.parent();
            if !self.is_visible(&parent) {
                self.copy_for_write(&parent, true);
            }
        }

        let committed = if self.workspace.nodes.contains_key(fqn) {
            None
        } else {
            self.committed(fqn)
        };

        match self.workspace.nodes.entry(fqn.clone()) {
            Entry::Occupied(entry) => {
                let copy = entry.into_mut();
                if copy.deleted {
                    if !create {
                        return None;
                    }
                    copy.deleted = false;
                    copy.recreated = copy.original;
                    copy.created = !copy.original;
                    copy.data.clear();
                    copy.changed = true;
                }
                Some(copy)
            }
            Entry::Vacant(entry) => match committed {
                Some(node) => Some(entry.insert(WorkingNode::copy_of(&node))),
                None if create => Some(entry.insert(WorkingNode::fresh())),
                None => None,
            },
        }
    }
}

impl DataView for WorkspaceView<'_> {
    fn data(&mut self, fqn: &Fqn) -> Option<NodeData> {
        if let Some(copy) = self.workspace.nodes.get(fqn) {
            return (!copy.deleted).then(|| copy.data.clone());
        }
        let node = self.committed(fqn)?;
        let copy = WorkingNode::copy_of(&node);
        let data = copy.data.clone();
        if self.repeatable_read {
            self.workspace.nodes.insert(fqn.clone(), copy);
        }
        Some(data)
    }

    fn children_names(&mut self, fqn: &Fqn) -> Option<BTreeSet<FqnElement>> {
        if !self.is_visible(fqn) {
            return None;
        }
        let mut names = BTreeSet::new();

        let replaced = self
            .workspace
            .nodes
            .get(fqn)
            .map(|copy| copy.created || copy.recreated)
            .unwrap_or(false);
        if !replaced {
            if let Some(node) = self.committed(fqn) {
                names.extend(
                    node.child_fqns()
                        .into_iter()
                        .filter(|child| self.container.peek_strict(child).is_some())
                        .filter_map(|child| child.last_element().cloned()),
                );
            }
        }

        for (child, copy) in self
            .workspace
            .nodes
            .range(fqn.clone()..)
            .take_while(|(candidate, _)| candidate.is_child_or_equals(fqn))
            .filter(|(candidate, _)| candidate.is_direct_child_of(fqn))
        {
            let Some(name) = child.last_element() else { continue };
            if copy.deleted {
                names.remove(name);
            } else {
                names.insert(name.clone());
            }
        }
        Some(names)
    }

    fn snapshot(&mut self, fqn: &Fqn) -> Option<NodeSnapshot> {
        let data = self.data(fqn)?;
        let children = self.children_names(fqn).unwrap_or_default();
        let committed = self.container.peek_strict(fqn);
        Some(NodeSnapshot {
            fqn: fqn.clone(),
            data,
            children,
            resident: committed.as_ref().map(|n| n.is_resident()).unwrap_or(false),
            version: self
                .workspace
                .nodes
                .get(fqn)
                .map(|copy| copy.version)
                .or_else(|| committed.map(|n| n.read().version()))
                .unwrap_or(0),
        })
    }

    fn put(&mut self, fqn: &Fqn, data: NodeData, erase: bool) -> NodeData {
        let Some(copy) = self.copy_for_write(fqn, true) else { return NodeData::new() };
        copy.changed = true;
        if erase {
            std::mem::replace(&mut copy.data, data)
        } else {
            let prior = copy.data.clone();
            copy.data.extend(data);
            prior
        }
    }

    fn put_key(&mut self, fqn: &Fqn, key: &str, value: Value) -> Option<Value> {
        let copy = self.copy_for_write(fqn, true)?;
        copy.changed = true;
        copy.data.insert(key.to_string(), value)
    }

    fn remove_key(&mut self, fqn: &Fqn, key: &str) -> Option<Value> {
        let copy = self.copy_for_write(fqn, false)?;
        let removed = copy.data.remove(key);
        if removed.is_some() {
            copy.changed = true;
        }
        removed
    }

    fn clear_data(&mut self, fqn: &Fqn) -> bool {
        match self.copy_for_write(fqn, false) {
            Some(copy) => {
                copy.data.clear();
                copy.changed = true;
                true
            }
            None => false,
        }
    }

    fn remove_node(&mut self, fqn: &Fqn) -> bool {
        if !self.is_visible(fqn) {
            return false;
        }

        if fqn.is_root() {
            for child in self.children_names(fqn).unwrap_or_default() {
                self.remove_node(&fqn.child(child));
            }
            return self.clear_data(fqn);
        }

        let Some(copy) = self.copy_for_write(fqn, false) else { return false };
        copy.deleted = true;
        copy.changed = true;
        copy.data.clear();

        let descendants: Vec<Fqn> = self
            .workspace
            .nodes
            .range(fqn.clone()..)
            .take_while(|(candidate, _)| candidate.is_child_or_equals(fqn))
            .filter(|(candidate, _)| candidate.is_child_of(fqn))
            .map(|(candidate, _)| candidate.clone())
            .collect();
        for descendant in descendants {
            if let Some(copy) = self.workspace.nodes.get_mut(&descendant) {
                copy.deleted = true;
                copy.data.clear();
            }
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DirectView;
    use serde_json::json;

    fn container() -> DataContainer {
        let container = DataContainer::new();
        container.start();
        container
    }

    fn fqn(s: &str) -> Fqn {
        Fqn::from_string(s)
    }

    fn data(pairs: &[(&str, Value)]) -> NodeData {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn seed(container: &DataContainer, path: &str, pairs: &[(&str, Value)]) {
        DirectView::new(container, None).put(&fqn(path), data(pairs), false);
    }

    #[test]
    fn test_writes_are_private_until_applied() {
        let container = container();
        let mut ws = Workspace::new();
        {
            let mut view = WorkspaceView::new(&container, &mut ws, false);
            view.put_key(&fqn("/a/b"), "k", json!(1));
            assert_eq!(view.get(&fqn("/a/b"), "k"), Some(json!(1)));
        }
        assert!(container.peek_strict(&fqn("/a/b")).is_none());

        ws.apply(&container);
        assert_eq!(container.data(&fqn("/a/b")), Some(data(&[("k", json!(1))])));
    }

    #[test]
    fn test_read_committed_sees_new_commits() {
        let container = container();
        seed(&container, "/a", &[("v", json!(1))]);
        let mut ws = Workspace::new();
        let mut view = WorkspaceView::new(&container, &mut ws, false);
        assert_eq!(view.get(&fqn("/a"), "v"), Some(json!(1)));

        seed(&container, "/a", &[("v", json!(2))]);
        assert_eq!(view.get(&fqn("/a"), "v"), Some(json!(2)));
    }

    #[test]
    fn test_repeatable_read_pins_first_read() {
        let container = container();
        seed(&container, "/a", &[("v", json!(1))]);
        let mut ws = Workspace::new();
        let mut view = WorkspaceView::new(&container, &mut ws, true);
        assert_eq!(view.get(&fqn("/a"), "v"), Some(json!(1)));

        seed(&container, "/a", &[("v", json!(2))]);
        assert_eq!(view.get(&fqn("/a"), "v"), Some(json!(1)));
    }

    #[test]
    fn test_write_skew_detection() {
        let container = container();
        seed(&container, "/a", &[("v", json!(1))]);
        let mut ws = Workspace::new();
        {
            let mut view = WorkspaceView::new(&container, &mut ws, true);
            view.get(&fqn("/a"), "v");
            view.put_key(&fqn("/a"), "v", json!(10));
        }
        assert!(ws.check_write_skew(&container).is_ok());

        seed(&container, "/a", &[("v", json!(2))]);
        assert!(matches!(ws.check_write_skew(&container), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_delete_then_recreate() {
        let container = container();
        seed(&container, "/a", &[("top", json!(1))]);
        seed(&container, "/a/b", &[("old", json!(1))]);
        seed(&container, "/a/sibling", &[("s", json!(1))]);

        let mut ws = Workspace::new();
        {
            let mut view = WorkspaceView::new(&container, &mut ws, false);
            assert!(view.remove_node(&fqn("/a")));
            assert!(!view.exists(&fqn("/a/b")));
            view.put_key(&fqn("/a/b"), "new", json!(2));
            assert_eq!(view.data(&fqn("/a/b")), Some(data(&[("new", json!(2))])));
            assert_eq!(
                view.children_names(&fqn("/a")).unwrap(),
                [FqnElement::from("b")].into_iter().collect()
            );
        }
        ws.apply(&container);

        assert_eq!(container.data(&fqn("/a/b")), Some(data(&[("new", json!(2))])));
        assert_eq!(container.data(&fqn("/a")), Some(NodeData::new()));
        assert!(container.peek_strict(&fqn("/a/sibling")).is_none());
    }

    #[test]
    fn test_children_merge_committed_and_private() {
        let container = container();
        seed(&container, "/p/x", &[]);
        seed(&container, "/p/y", &[]);

        let mut ws = Workspace::new();
        let mut view = WorkspaceView::new(&container, &mut ws, false);
        view.put(&fqn("/p/z"), NodeData::new(), false);
        view.remove_node(&fqn("/p/x"));

        let names: Vec<String> = view
            .children_names(&fqn("/p"))
            .unwrap()
            .into_iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, vec!["y", "z"]);
    }

    #[test]
    fn test_intermediate_copies_do_not_overwrite_data() {
        let container = container();
        let mut ws = Workspace::new();
        {
            let mut view = WorkspaceView::new(&container, &mut ws, false);
            view.put_key(&fqn("/a/b"), "k", json!(1));
        }
        // Another writer commits data at the intermediate first
        seed(&container, "/a", &[("mine", json!(true))]);
        ws.apply(&container);
        assert_eq!(container.data(&fqn("/a")), Some(data(&[("mine", json!(true))])));
    }
}
