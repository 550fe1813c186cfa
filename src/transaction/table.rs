//! Transaction Table
//!
//! Maps each [`GlobalTransaction`] to the cache-side state it accumulates:
//! the lock release ledger, the nodes it created, the undo log, the
//! modification list for replication and write-through, and the MVCC
//! working copies.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::GlobalTransaction;
use crate::commands::ReplicableCommand;
use crate::fqn::Fqn;
use crate::lock::AcquiredLock;
use crate::tree::{TreeNode, UndoEntry, Workspace};

/// Cache state owned by one transaction
#[derive(Debug)]
pub struct TransactionContext {
    gtx: GlobalTransaction,
    remote: bool,
    /// Locks to release at commit or rollback
    pub locks: Vec<AcquiredLock>,
    /// Nodes created by this transaction, in creation order
    pub created: Vec<Arc<TreeNode>>,
    /// Prior node states, replayed in reverse on rollback
    pub undo: Vec<UndoEntry>,
    /// Roots of subtrees tombstoned by this transaction
    pub removed: Vec<Fqn>,
    /// Modifications, in order
    pub modifications: Vec<ReplicableCommand>,
    /// Modifications to send to other members
    pub replicable: Vec<ReplicableCommand>,
    /// MVCC working copies
    pub workspace: Workspace,
    /// True once the prepare phase was replicated synchronously
    pub prepare_replicated: bool,
}

impl TransactionContext {
    pub fn new(gtx: GlobalTransaction, remote: bool) -> Self {
        Self {
            gtx,
            remote,
            locks: Vec::new(),
            created: Vec::new(),
            undo: Vec::new(),
            removed: Vec::new(),
            modifications: Vec::new(),
            replicable: Vec::new(),
            workspace: Workspace::new(),
            prepare_replicated: false,
        }
    }

    pub fn gtx(&self) -> &GlobalTransaction {
        &self.gtx
    }

    /// True for transactions that originated on another member
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// True if this transaction already holds the ledger entry for `fqn`
    pub fn has_lock(&self, fqn: &Fqn) -> bool {
        self.locks.iter().any(|lock| &lock.fqn == fqn)
    }
}

/// Shared handle to a transaction's state
pub type SharedTransactionContext = Arc<Mutex<TransactionContext>>;

/// Registry of in-flight transactions
#[derive(Debug, Default)]
pub struct TransactionTable {
    entries: DashMap<GlobalTransaction, SharedTransactionContext>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, gtx: &GlobalTransaction) -> Option<SharedTransactionContext> {
        self.entries.get(gtx).map(|entry| Arc::clone(entry.value()))
    }

    /// Context for `gtx`, creating it on first use; the flag reports creation
    pub fn get_or_create(&self, gtx: &GlobalTransaction, remote: bool) -> (SharedTransactionContext, bool) {
        let mut created = false;
        let context = Arc::clone(
            self.entries
                .entry(gtx.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Mutex::new(TransactionContext::new(gtx.clone(), remote)))
                })
                .value(),
        );
        (context, created)
    }

    pub fn remove(&self, gtx: &GlobalTransaction) -> Option<SharedTransactionContext> {
        self.entries.remove(gtx).map(|(_, context)| context)
    }

    pub fn contains(&self, gtx: &GlobalTransaction) -> bool {
        self.entries.contains_key(gtx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn local_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().lock().is_remote()).count()
    }
}

// =============================================================================
// Tests
// =============================================================================
