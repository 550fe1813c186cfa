//! TreeCache - Transactional Tree-Structured Cache
//!
//! An in-process cache whose entries live in a tree of nodes addressed by
//! fully qualified names ([`Fqn`]). Every node holds a key/value map.
//! Operations run inside the caller's transaction when one is active and
//! are isolated either by per-node pessimistic locks or by MVCC working
//! copies over striped locks.
//!
//! # Architecture
//!
//! Every call becomes a [`commands::Command`] and travels through a chain
//! of interceptors assembled from the configuration:
//!
//! ```text
//! TreeCache → InvocationContext → Tx → Notification → Replication
//!           → Loader → Locking → Store → Eviction → Call → DataContainer
//! ```
//!
//! Persistence, group communication and eviction policies plug in through
//! the ports in [`domain::ports`]; reference implementations live in
//! [`adapters`].
//!
//! # Modules
//!
//! - [`adapters`] - In-memory loader, in-process transport, FIFO policy, listeners
//! - [`cache`] - `TreeCache` API, builder and lifecycle
//! - [`commands`] - Command set and wire form
//! - [`config`] - Configuration
//! - [`context`] - Per-invocation state and options
//! - [`domain`] - Collaborator ports and events
//! - [`error`] - Error types
//! - [`eviction`] - Eviction manager
//! - [`fqn`] - Fully qualified names
//! - [`interceptors`] - Interceptor chain and its stages
//! - [`lock`] - Pessimistic and striped lock managers
//! - [`notifier`] - Listener registry
//! - [`stats`] - Management statistics
//! - [`transaction`] - Transactions and their per-cache state
//! - [`tree`] - Nodes, data container and data views

pub mod adapters;
pub mod cache;
pub mod commands;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod eviction;
pub mod fqn;
pub mod interceptors;
pub mod lock;
pub mod notifier;
pub mod stats;
pub mod transaction;
pub mod tree;

// Re-export commonly used types
pub use cache::{CacheBuilder, ComponentStatus, TreeCache};
pub use config::{CacheConfig, CacheMode, IsolationLevel, NodeLockingScheme};
pub use context::Options;
pub use domain::{CacheEvent, EventKind};
pub use error::{Error, Result};
pub use fqn::{Fqn, FqnElement};
pub use tree::{NodeData, NodeSnapshot, Value};
