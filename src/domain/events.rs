//! Cache Events
//!
//! Immutable records of things that happened (or are about to happen) in
//! the cache. Node events are delivered twice, once with `pre: true` before
//! the change and once after it; a listener failing the pre phase vetoes
//! the operation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fqn::Fqn;
use crate::transaction::GlobalTransaction;
use crate::tree::NodeData;

/// Closed set of event kinds used as subscription keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    NodeCreated,
    NodeModified,
    NodeRemoved,
    NodeVisited,
    NodeEvicted,
    NodeLoaded,
    NodeActivated,
    NodePassivated,
    NodeMoved,
    NodeInvalidated,
    TransactionRegistered,
    TransactionCompleted,
    CacheStarted,
    CacheStopped,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::NodeCreated,
        EventKind::NodeModified,
        EventKind::NodeRemoved,
        EventKind::NodeVisited,
        EventKind::NodeEvicted,
        EventKind::NodeLoaded,
        EventKind::NodeActivated,
        EventKind::NodePassivated,
        EventKind::NodeMoved,
        EventKind::NodeInvalidated,
        EventKind::TransactionRegistered,
        EventKind::TransactionCompleted,
        EventKind::CacheStarted,
        EventKind::CacheStopped,
    ];

    /// Cache start/stop events
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, EventKind::CacheStarted | EventKind::CacheStopped)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a node's data was modified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationType {
    PutData,
    PutMap,
    RemoveData,
}

/// Event delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    // =========================================================================
    // Node Events
    // =========================================================================
    NodeCreated {
        fqn: Fqn,
        pre: bool,
        origin_local: bool,
        transaction: Option<GlobalTransaction>,
        timestamp: DateTime<Utc>,
    },

    NodeModified {
        fqn: Fqn,
        pre: bool,
        origin_local: bool,
        transaction: Option<GlobalTransaction>,
        modification: ModificationType,
        data: Option<NodeData>,
        timestamp: DateTime<Utc>,
    },

    NodeRemoved {
        fqn: Fqn,
        pre: bool,
        origin_local: bool,
        transaction: Option<GlobalTransaction>,
        timestamp: DateTime<Utc>,
    },

    NodeVisited {
        fqn: Fqn,
        pre: bool,
        timestamp: DateTime<Utc>,
    },

    NodeEvicted {
        fqn: Fqn,
        pre: bool,
        timestamp: DateTime<Utc>,
    },

    NodeLoaded {
        fqn: Fqn,
        pre: bool,
        data: Option<NodeData>,
        timestamp: DateTime<Utc>,
    },

    NodeActivated {
        fqn: Fqn,
        pre: bool,
        timestamp: DateTime<Utc>,
    },

    NodePassivated {
        fqn: Fqn,
        pre: bool,
        data: Option<NodeData>,
        timestamp: DateTime<Utc>,
    },

    NodeMoved {
        from: Fqn,
        to: Fqn,
        pre: bool,
        origin_local: bool,
        transaction: Option<GlobalTransaction>,
        timestamp: DateTime<Utc>,
    },

    NodeInvalidated {
        fqn: Fqn,
        pre: bool,
        origin_local: bool,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Transaction Events
    // =========================================================================
    TransactionRegistered {
        gtx: GlobalTransaction,
        timestamp: DateTime<Utc>,
    },

    TransactionCompleted {
        gtx: GlobalTransaction,
        successful: bool,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Lifecycle Events
    // =========================================================================
    CacheStarted { timestamp: DateTime<Utc> },

    CacheStopped { timestamp: DateTime<Utc> },
}

impl CacheEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::NodeCreated { .. } => EventKind::NodeCreated,
            CacheEvent::NodeModified { .. } => EventKind::NodeModified,
            CacheEvent::NodeRemoved { .. } => EventKind::NodeRemoved,
            CacheEvent::NodeVisited { .. } => EventKind::NodeVisited,
            CacheEvent::NodeEvicted { .. } => EventKind::NodeEvicted,
            CacheEvent::NodeLoaded { .. } => EventKind::NodeLoaded,
            CacheEvent::NodeActivated { .. } => EventKind::NodeActivated,
            CacheEvent::NodePassivated { .. } => EventKind::NodePassivated,
            CacheEvent::NodeMoved { .. } => EventKind::NodeMoved,
            CacheEvent::NodeInvalidated { .. } => EventKind::NodeInvalidated,
            CacheEvent::TransactionRegistered { .. } => EventKind::TransactionRegistered,
            CacheEvent::TransactionCompleted { .. } => EventKind::TransactionCompleted,
            CacheEvent::CacheStarted { .. } => EventKind::CacheStarted,
            CacheEvent::CacheStopped { .. } => EventKind::CacheStopped,
        }
    }

    /// Node the event is about
    pub fn fqn(&self) -> Option<&Fqn> {
        match self {
            CacheEvent::NodeCreated { fqn, .. }
            | CacheEvent::NodeModified { fqn, .. }
            | CacheEvent::NodeRemoved { fqn, .. }
            | CacheEvent::NodeVisited { fqn, .. }
            | CacheEvent::NodeEvicted { fqn, .. }
            | CacheEvent::NodeLoaded { fqn, .. }
            | CacheEvent::NodeActivated { fqn, .. }
            | CacheEvent::NodePassivated { fqn, .. }
            | CacheEvent::NodeInvalidated { fqn, .. } => Some(fqn),
            CacheEvent::NodeMoved { from, .. } => Some(from),
            _ => None,
        }
    }

    /// True for the before-the-change delivery of a node event
    pub fn is_pre(&self) -> bool {
        match self {
            CacheEvent::NodeCreated { pre, .. }
            | CacheEvent::NodeModified { pre, .. }
            | CacheEvent::NodeRemoved { pre, .. }
            | CacheEvent::NodeVisited { pre, .. }
            | CacheEvent::NodeEvicted { pre, .. }
            | CacheEvent::NodeLoaded { pre, .. }
            | CacheEvent::NodeActivated { pre, .. }
            | CacheEvent::NodePassivated { pre, .. }
            | CacheEvent::NodeMoved { pre, .. }
            | CacheEvent::NodeInvalidated { pre, .. } => *pre,
            _ => false,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::NodeCreated { timestamp, .. }
            | CacheEvent::NodeModified { timestamp, .. }
            | CacheEvent::NodeRemoved { timestamp, .. }
            | CacheEvent::NodeVisited { timestamp, .. }
            | CacheEvent::NodeEvicted { timestamp, .. }
            | CacheEvent::NodeLoaded { timestamp, .. }
            | CacheEvent::NodeActivated { timestamp, .. }
            | CacheEvent::NodePassivated { timestamp, .. }
            | CacheEvent::NodeMoved { timestamp, .. }
            | CacheEvent::NodeInvalidated { timestamp, .. }
            | CacheEvent::TransactionRegistered { timestamp, .. }
            | CacheEvent::TransactionCompleted { timestamp, .. }
            | CacheEvent::CacheStarted { timestamp }
            | CacheEvent::CacheStopped { timestamp } => *timestamp,
        }
    }

    /// Event type name
    pub fn event_type(&self) -> String {
        self.kind().to_string()
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl CacheEvent {
    pub fn node_created(fqn: Fqn, pre: bool, origin_local: bool, transaction: Option<GlobalTransaction>) -> Self {
        CacheEvent::NodeCreated {
            fqn,
            pre,
            origin_local,
            transaction,
            timestamp: Utc::now(),
        }
    }

    pub fn node_modified(
        fqn: Fqn,
        pre: bool,
        origin_local: bool,
        transaction: Option<GlobalTransaction>,
        modification: ModificationType,
        data: Option<NodeData>,
    ) -> Self {
        CacheEvent::NodeModified {
            fqn,
            pre,
            origin_local,
            transaction,
            modification,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn node_removed(fqn: Fqn, pre: bool, origin_local: bool, transaction: Option<GlobalTransaction>) -> Self {
        CacheEvent::NodeRemoved {
            fqn,
            pre,
            origin_local,
            transaction,
            timestamp: Utc::now(),
        }
    }

    pub fn node_visited(fqn: Fqn, pre: bool) -> Self {
        CacheEvent::NodeVisited {
            fqn,
            pre,
            timestamp: Utc::now(),
        }
    }

    pub fn node_evicted(fqn: Fqn, pre: bool) -> Self {
        CacheEvent::NodeEvicted {
            fqn,
            pre,
            timestamp: Utc::now(),
        }
    }

    pub fn node_loaded(fqn: Fqn, pre: bool, data: Option<NodeData>) -> Self {
        CacheEvent::NodeLoaded {
            fqn,
            pre,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn node_activated(fqn: Fqn, pre: bool) -> Self {
        CacheEvent::NodeActivated {
            fqn,
            pre,
            timestamp: Utc::now(),
        }
    }

    pub fn node_passivated(fqn: Fqn, pre: bool, data: Option<NodeData>) -> Self {
        CacheEvent::NodePassivated {
            fqn,
            pre,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn node_moved(
        from: Fqn,
        to: Fqn,
        pre: bool,
        origin_local: bool,
        transaction: Option<GlobalTransaction>,
    ) -> Self {
        CacheEvent::NodeMoved {
            from,
            to,
            pre,
            origin_local,
            transaction,
            timestamp: Utc::now(),
        }
    }

    pub fn node_invalidated(fqn: Fqn, pre: bool, origin_local: bool) -> Self {
        CacheEvent::NodeInvalidated {
            fqn,
            pre,
            origin_local,
            timestamp: Utc::now(),
        }
    }

    pub fn transaction_registered(gtx: GlobalTransaction) -> Self {
        CacheEvent::TransactionRegistered {
            gtx,
            timestamp: Utc::now(),
        }
    }

    pub fn transaction_completed(gtx: GlobalTransaction, successful: bool) -> Self {
        CacheEvent::TransactionCompleted {
            gtx,
            successful,
            timestamp: Utc::now(),
        }
    }

    pub fn cache_started() -> Self {
        CacheEvent::CacheStarted { timestamp: Utc::now() }
    }

    pub fn cache_stopped() -> Self {
        CacheEvent::CacheStopped { timestamp: Utc::now() }
    }
}

// =============================================================================
// Tests
// =============================================================================
