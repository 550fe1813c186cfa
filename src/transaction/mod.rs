//! Transactions
//!
//! - [`GlobalTransaction`] - cluster-wide transaction identity
//! - [`TransactionManager`] - thread-bound begin/commit/rollback with
//!   [`Synchronization`] callbacks
//! - [`TransactionTable`] - per-transaction cache state ([`TransactionContext`])

mod manager;
mod table;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use manager::{Synchronization, Transaction, TransactionManager, TransactionStatus};
pub use table::{SharedTransactionContext, TransactionContext, TransactionTable};

/// Cluster member address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(Uuid);

impl Address {
    /// Fresh random address
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// Transaction identity: originating address plus a local sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalTransaction {
    address: Address,
    id: u64,
}

impl GlobalTransaction {
    pub fn new(address: Address, id: u64) -> Self {
        Self { address, id }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTransaction:<{}>:{}", self.address, self.id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gtx_identity() {
        let addr = Address::random();
        let a = GlobalTransaction::new(addr, 1);
        let b = GlobalTransaction::new(addr, 1);
        let c = GlobalTransaction::new(Address::random(), 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string().starts_with("GlobalTransaction:<"));
    }

    #[test]
    fn test_gtx_serde() {
        let gtx = GlobalTransaction::new(Address::random(), 42);
        let json = serde_json::to_string(&gtx).unwrap();
        let back: GlobalTransaction = serde_json::from_str(&json).unwrap();
        assert_eq!(gtx, back);
    }
}
