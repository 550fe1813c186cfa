//! Error types for the tree cache

use std::time::Duration;

use thiserror::Error;

use crate::fqn::Fqn;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tree cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    /// Lock acquisition exceeded its bound
    #[error("Unable to acquire {mode} lock on {fqn} for {owner} after {timeout:?}")]
    LockTimeout {
        fqn: Fqn,
        owner: String,
        mode: String,
        timeout: Duration,
    },

    /// Unlock by a non-owner or a second unlock of the same acquisition
    #[error("Lock on {fqn} released by {owner}, which does not own it")]
    IllegalLockRelease { fqn: Fqn, owner: String },

    // =========================================================================
    // Lifecycle & Configuration Errors
    // =========================================================================
    /// Operation attempted outside the allowed lifecycle phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Bad configuration detected while building the cache
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A listener failed during a lifecycle transition
    #[error("Lifecycle failure: {0}")]
    Lifecycle(String),

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// Commit attempted on a transaction marked rollback-only
    #[error("Transaction marked rollback-only: {0}")]
    RollbackOnly(String),

    /// A pre-event listener vetoed the operation
    #[error("{kind} vetoed by listener: {reason}")]
    Vetoed { kind: String, reason: String },

    // =========================================================================
    // Argument Errors
    // =========================================================================
    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Index out of range
    #[error("Index {index} out of range for size {size}")]
    OutOfRange { index: usize, size: usize },

    /// Node does not exist
    #[error("Node not found: {0}")]
    NodeNotFound(Fqn),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Remote delivery failed
    #[error("Replication error: {0}")]
    Replication(String),

    /// Cache loader failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Statistics registry failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// True for lock acquisition timeouts
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }

    /// True if retrying the call (or the transaction) may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::Replication(_) | Error::Vetoed { .. }
        )
    }

    /// True if a transaction that saw this error must roll back
    pub fn forces_rollback(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::Replication(_)
                | Error::Persistence(_)
                | Error::Vetoed { .. }
                | Error::IllegalLockRelease { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
