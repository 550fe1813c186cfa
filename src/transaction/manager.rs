//! Thread-bound Transaction Manager
//!
//! `begin()` binds a new transaction to the calling thread; the cache
//! enlists lazily on first use by registering a [`Synchronization`].
//! `commit()` runs every `before_completion` (the prepare phase) and then
//! every `after_completion` with the final status.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Address, GlobalTransaction};
use crate::error::{Error, Result};

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    MarkedRollback,
    Preparing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionStatus {
    /// True once the outcome is final
    pub fn is_completed(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }
}

/// Participant callbacks run at transaction completion
pub trait Synchronization: Send + Sync {
    /// Prepare phase; an error rolls the transaction back
    fn before_completion(&self) -> Result<()>;

    /// Commit or rollback phase
    fn after_completion(&self, status: TransactionStatus) -> Result<()>;
}

/// A running transaction
pub struct Transaction {
    gtx: GlobalTransaction,
    status: Mutex<TransactionStatus>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

impl Transaction {
    fn new(gtx: GlobalTransaction) -> Self {
        Self {
            gtx,
            status: Mutex::new(TransactionStatus::Active),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    pub fn gtx(&self) -> &GlobalTransaction {
        &self.gtx
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.status() == TransactionStatus::MarkedRollback
    }

    /// Mark so that the only possible outcome is rollback
    pub fn set_rollback_only(&self) {
        let mut status = self.status.lock();
        if *status == TransactionStatus::Active {
            *status = TransactionStatus::MarkedRollback;
        }
    }

    /// Enlist a participant
    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<()> {
        match self.status() {
            TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                self.synchronizations.lock().push(sync);
                Ok(())
            }
            other => Err(Error::InvalidState(format!(
                "cannot enlist in {} with status {:?}",
                self.gtx, other
            ))),
        }
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    fn participants(&self) -> Vec<Arc<dyn Synchronization>> {
        self.synchronizations.lock().clone()
    }

    fn finish(&self, status: TransactionStatus) -> Result<()> {
        self.set_status(match status {
            TransactionStatus::Committed => TransactionStatus::Committing,
            _ => TransactionStatus::RollingBack,
        });
        let mut first_error = None;
        for sync in self.participants() {
            if let Err(e) = sync.after_completion(status) {
                warn!(gtx = %self.gtx, error = %e, "after_completion failed");
                first_error.get_or_insert(e);
            }
        }
        self.set_status(status);
        first_error.map_or(Ok(()), Err)
    }

    fn commit(&self) -> Result<()> {
        if self.is_rollback_only() {
            self.finish(TransactionStatus::RolledBack)?;
            return Err(Error::RollbackOnly(self.gtx.to_string()));
        }

        self.set_status(TransactionStatus::Preparing);
        for sync in self.participants() {
            if let Err(e) = sync.before_completion() {
                warn!(gtx = %self.gtx, error = %e, "prepare failed, rolling back");
                if let Err(rollback_error) = self.finish(TransactionStatus::RolledBack) {
                    warn!(gtx = %self.gtx, error = %rollback_error, "rollback after failed prepare also failed");
                }
                return Err(e);
            }
        }
        self.finish(TransactionStatus::Committed)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("gtx", &self.gtx)
            .field("status", &self.status())
            .field("participants", &self.synchronizations.lock().len())
            .finish()
    }
}

/// Transaction manager binding transactions to threads
pub struct TransactionManager {
    address: Address,
    next_id: AtomicU64,
    bound: Mutex<HashMap<ThreadId, Arc<Transaction>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(Address::random())
    }
}

impl TransactionManager {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            next_id: AtomicU64::new(1),
            bound: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Start a transaction on the calling thread
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        let mut bound = self.bound.lock();
        let thread = thread::current().id();
        if let Some(existing) = bound.get(&thread) {
            return Err(Error::InvalidState(format!(
                "thread already associated with {}",
                existing.gtx()
            )));
        }
        let gtx = GlobalTransaction::new(self.address, self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(gtx = %gtx, "transaction started");
        let tx = Arc::new(Transaction::new(gtx));
        bound.insert(thread, Arc::clone(&tx));
        Ok(tx)
    }

    /// Transaction bound to the calling thread
    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.bound.lock().get(&thread::current().id()).cloned()
    }

    fn take_current(&self) -> Result<Arc<Transaction>> {
        self.bound
            .lock()
            .remove(&thread::current().id())
            .ok_or_else(|| Error::InvalidState("no transaction associated with thread".to_string()))
    }

    /// Commit the calling thread's transaction
    pub fn commit(&self) -> Result<()> {
        let tx = self.take_current()?;
        let result = tx.commit();
        debug!(gtx = %tx.gtx(), status = ?tx.status(), "transaction completed");
        result
    }

    /// Roll back the calling thread's transaction
    pub fn rollback(&self) -> Result<()> {
        let tx = self.take_current()?;
        let result = tx.finish(TransactionStatus::RolledBack);
        debug!(gtx = %tx.gtx(), "transaction rolled back");
        result
    }

    /// Mark the calling thread's transaction rollback-only
    pub fn set_rollback_only(&self) -> Result<()> {
        self.current()
            .ok_or_else(|| Error::InvalidState("no transaction associated with thread".to_string()))?
            .set_rollback_only();
        Ok(())
    }

    /// Detach the calling thread's transaction
    pub fn suspend(&self) -> Option<Arc<Transaction>> {
        self.bound.lock().remove(&thread::current().id())
    }

    /// Attach a suspended transaction to the calling thread
    pub fn resume(&self, tx: Arc<Transaction>) -> Result<()> {
        if tx.status().is_completed() {
            return Err(Error::InvalidState(format!("{} already completed", tx.gtx())));
        }
        let mut bound = self.bound.lock();
        let thread = thread::current().id();
        if bound.contains_key(&thread) {
            return Err(Error::InvalidState(
                "thread already associated with a transaction".to_string(),
            ));
        }
        bound.insert(thread, tx);
        Ok(())
    }

    /// Status of the calling thread's transaction
    pub fn status(&self) -> Option<TransactionStatus> {
        self.current().map(|tx| tx.status())
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("address", &self.address)
            .field("bound", &self.bound.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
