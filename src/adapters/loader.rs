//! In-Memory Cache Loader
//!
//! Implements the `CacheLoader` port over an ordered map. Stored paths
//! behave like a tree: storing a node stores its ancestors, removing a node
//! removes its subtree. Transactional modifications are staged per
//! transaction until commit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::domain::ports::{CacheLoader, Modification};
use crate::error::{Error, Result};
use crate::fqn::{Fqn, FqnElement};
use crate::transaction::GlobalTransaction;
use crate::tree::{NodeData, Value};

/// Volatile store for tests, demos and the benchmark
#[derive(Debug, Default)]
pub struct InMemoryCacheLoader {
    nodes: RwLock<BTreeMap<Fqn, NodeData>>,
    staged: Mutex<HashMap<GlobalTransaction, Vec<Modification>>>,
    failing: AtomicBool,
}

impl InMemoryCacheLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a persistence error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Number of stored nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Transactions with staged modifications
    pub fn staged_transactions(&self) -> usize {
        self.staged.lock().len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(Error::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Entry at `fqn`, creating it and its ancestors
    fn entry<'a>(nodes: &'a mut BTreeMap<Fqn, NodeData>, fqn: &Fqn) -> &'a mut NodeData {
        for ancestor in fqn.lineage() {
            if ancestor != *fqn {
                nodes.entry(ancestor).or_default();
            }
        }
        nodes.entry(fqn.clone()).or_default()
    }

    fn subtree_keys(nodes: &BTreeMap<Fqn, NodeData>, fqn: &Fqn) -> Vec<Fqn> {
        nodes
            .range(fqn.clone()..)
            .take_while(|(candidate, _)| candidate.is_child_or_equals(fqn))
            .map(|(candidate, _)| candidate.clone())
            .collect()
    }
}

impl CacheLoader for InMemoryCacheLoader {
    fn get(&self, fqn: &Fqn) -> Result<Option<NodeData>> {
        Ok(self.nodes.read().get(fqn).cloned())
    }

    fn exists(&self, fqn: &Fqn) -> Result<bool> {
        Ok(self.nodes.read().contains_key(fqn))
    }

    fn get_children_names(&self, fqn: &Fqn) -> Result<Option<BTreeSet<FqnElement>>> {
        let nodes = self.nodes.read();
        if !fqn.is_root() && !nodes.contains_key(fqn) {
            return Ok(None);
        }
        let names = nodes
            .range(fqn.clone()..)
            .take_while(|(candidate, _)| candidate.is_child_or_equals(fqn))
            .filter(|(candidate, _)| candidate.is_direct_child_of(fqn))
            .filter_map(|(candidate, _)| candidate.last_element().cloned())
            .collect();
        Ok(Some(names))
    }

    fn put(&self, fqn: &Fqn, data: &NodeData) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.nodes.write();
        Self::entry(&mut nodes, fqn).extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        trace!(fqn = %fqn, keys = data.len(), "stored node");
        Ok(())
    }

    fn put_key(&self, fqn: &Fqn, key: &str, value: &Value) -> Result<Option<Value>> {
        self.check_writable()?;
        let mut nodes = self.nodes.write();
        Ok(Self::entry(&mut nodes, fqn).insert(key.to_string(), value.clone()))
    }

    fn remove(&self, fqn: &Fqn) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.nodes.write();
        if fqn.is_root() {
            nodes.clear();
            return Ok(());
        }
        for key in Self::subtree_keys(&nodes, fqn) {
            nodes.remove(&key);
        }
        trace!(fqn = %fqn, "removed stored subtree");
        Ok(())
    }

    fn remove_key(&self, fqn: &Fqn, key: &str) -> Result<Option<Value>> {
        self.check_writable()?;
        Ok(self.nodes.write().get_mut(fqn).and_then(|data| data.remove(key)))
    }

    fn remove_data(&self, fqn: &Fqn) -> Result<()> {
        self.check_writable()?;
        if let Some(data) = self.nodes.write().get_mut(fqn) {
            data.clear();
        }
        Ok(())
    }

    fn prepare(&self, gtx: &GlobalTransaction, modifications: &[Modification], one_phase: bool) -> Result<()> {
        self.check_writable()?;
        if one_phase {
            return self.apply(modifications);
        }
        debug!(gtx = %gtx, count = modifications.len(), "staged modifications");
        self.staged
            .lock()
            .entry(gtx.clone())
            .or_default()
            .extend(modifications.iter().cloned());
        Ok(())
    }

    fn commit(&self, gtx: &GlobalTransaction) -> Result<()> {
        let Some(modifications) = self.staged.lock().remove(gtx) else {
            return Ok(());
        };
        debug!(gtx = %gtx, count = modifications.len(), "committing staged modifications");
        self.apply(&modifications)
    }

    fn rollback(&self, gtx: &GlobalTransaction) {
        if self.staged.lock().remove(gtx).is_some() {
            debug!(gtx = %gtx, "discarded staged modifications");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
