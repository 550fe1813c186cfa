//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Cache Core                                │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  CacheLoader │ Transport │ EvictionPolicy │ CacheListener  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryCacheLoader │ InMemoryCluster │ FifoEvictionPolicy │ │
//! │  │ LoggingListener │ EventCollector                            │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use treecache::adapters::{InMemoryCacheLoader, InMemoryCluster};
//! use treecache::{CacheBuilder, CacheConfig, CacheMode};
//!
//! let cluster = InMemoryCluster::new();
//! let config = CacheConfig {
//!     cache_mode: CacheMode::ReplSync,
//!     ..CacheConfig::default()
//! };
//! let cache = CacheBuilder::new(config)
//!     .with_transport(cluster.join())
//!     .build()?;
//! ```

mod event_logger;
mod fifo_policy;
mod loader;
mod transport;

pub use event_logger::{EventCollector, LoggingListener};
pub use fifo_policy::FifoEvictionPolicy;
pub use loader::InMemoryCacheLoader;
pub use transport::{InMemoryCluster, InMemoryTransport};
