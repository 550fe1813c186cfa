//! Cache Configuration
//!
//! Serde-deserializable (YAML) configuration surface. Every field has a
//! default, so a partial document is valid. Durations are written as
//! milliseconds.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::ports::DeliveryMode;
use crate::error::{Error, Result};

/// Default lock acquisition timeout
pub const DEFAULT_LOCK_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default synchronous replication timeout
pub const DEFAULT_SYNC_REPL_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Enumerations
// =============================================================================

/// Clustering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    #[default]
    Local,
    ReplSync,
    ReplAsync,
    InvalidationSync,
    InvalidationAsync,
}

impl CacheMode {
    pub fn is_replicated(&self) -> bool {
        matches!(self, CacheMode::ReplSync | CacheMode::ReplAsync)
    }

    pub fn is_invalidation(&self) -> bool {
        matches!(self, CacheMode::InvalidationSync | CacheMode::InvalidationAsync)
    }

    /// True for every mode that talks to other members
    pub fn is_clustered(&self) -> bool {
        *self != CacheMode::Local
    }

    pub fn is_synchronous(&self) -> bool {
        matches!(self, CacheMode::ReplSync | CacheMode::InvalidationSync)
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.is_synchronous() {
            DeliveryMode::Sync
        } else {
            DeliveryMode::Async
        }
    }
}

/// Node locking scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeLockingScheme {
    Pessimistic,
    /// Accepted for compatibility; runs on the MVCC strategy
    Optimistic,
    #[default]
    Mvcc,
}

impl NodeLockingScheme {
    /// Scheme actually used
    pub fn effective(&self) -> NodeLockingScheme {
        match self {
            NodeLockingScheme::Optimistic => NodeLockingScheme::Mvcc,
            other => *other,
        }
    }

    pub fn is_mvcc(&self) -> bool {
        self.effective() == NodeLockingScheme::Mvcc
    }
}

impl fmt::Display for NodeLockingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeLockingScheme::Pessimistic => write!(f, "pessimistic"),
            NodeLockingScheme::Optimistic => write!(f, "optimistic"),
            NodeLockingScheme::Mvcc => write!(f, "mvcc"),
        }
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Level actually enforced by `scheme`
    ///
    /// MVCC only implements read-committed and repeatable-read.
    pub fn effective_for(&self, scheme: NodeLockingScheme) -> IsolationLevel {
        if !scheme.is_mvcc() {
            return *self;
        }
        match self {
            IsolationLevel::None | IsolationLevel::ReadUncommitted => IsolationLevel::ReadCommitted,
            IsolationLevel::Serializable => IsolationLevel::RepeatableRead,
            other => *other,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where a custom interceptor is spliced into the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptorPosition {
    First,
    /// Immediately before the terminal call interceptor
    Last,
    Index(usize),
    Before(String),
    After(String),
}

// =============================================================================
// Sections
// =============================================================================

/// Cache loader section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Store shared by every member; only the originator writes
    pub shared: bool,
    /// Write to the store on eviction instead of on every change
    pub passivation: bool,
    pub fetch_persistent_state: bool,
    /// Read-through only
    pub ignore_modifications: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            shared: false,
            passivation: false,
            fetch_persistent_state: false,
            ignore_modifications: false,
        }
    }
}

/// Eviction section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Period of the background eviction pass
    #[serde(with = "duration_ms")]
    pub wake_up_interval: Duration,
    /// Capacity of the node event queue
    pub event_queue_size: usize,
    /// Node bound of the default FIFO policy; 0 means unbounded
    pub max_nodes: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            wake_up_interval: Duration::from_secs(5),
            event_queue_size: 200_000,
            max_nodes: 10_000,
        }
    }
}

/// A custom interceptor placement, resolved by name against the
/// interceptors registered on the builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomInterceptorConfig {
    pub name: String,
    pub position: InterceptorPosition,
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Complete cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_mode: CacheMode,
    pub node_locking_scheme: NodeLockingScheme,
    pub isolation_level: IsolationLevel,
    #[serde(with = "duration_ms")]
    pub lock_acquisition_timeout: Duration,
    pub lock_parent_for_child_insert_remove: bool,
    /// MVCC stripe count, rounded up to a power of two
    pub concurrency_level: usize,
    /// Fail a repeatable-read MVCC commit whose written nodes changed since read
    pub write_skew_check: bool,
    pub expose_management_statistics: bool,
    #[serde(with = "duration_ms")]
    pub sync_repl_timeout: Duration,
    /// Batch asynchronous replication
    pub use_repl_queue: bool,
    #[serde(with = "duration_ms")]
    pub repl_queue_interval: Duration,
    pub repl_queue_max_elements: usize,
    pub loader: Option<LoaderConfig>,
    pub eviction: Option<EvictionConfig>,
    pub custom_interceptors: Vec<CustomInterceptorConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Local,
            node_locking_scheme: NodeLockingScheme::Mvcc,
            isolation_level: IsolationLevel::RepeatableRead,
            lock_acquisition_timeout: DEFAULT_LOCK_ACQUISITION_TIMEOUT,
            lock_parent_for_child_insert_remove: false,
            concurrency_level: crate::lock::DEFAULT_CONCURRENCY_LEVEL,
            write_skew_check: false,
            expose_management_statistics: true,
            sync_repl_timeout: DEFAULT_SYNC_REPL_TIMEOUT,
            use_repl_queue: false,
            repl_queue_interval: Duration::from_secs(5),
            repl_queue_max_elements: 1000,
            loader: None,
            eviction: None,
            custom_interceptors: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::InvalidConfiguration(format!("invalid YAML: {}", e)))
    }

    /// Read and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::InvalidConfiguration(format!("cannot serialize: {}", e)))
    }

    /// Check settings that do not depend on collaborators
    pub fn validate(&self) -> Result<()> {
        if self.lock_acquisition_timeout.is_zero() {
            return Err(Error::InvalidConfiguration(
                "lock_acquisition_timeout must be greater than zero".to_string(),
            ));
        }
        if self.concurrency_level == 0 {
            return Err(Error::InvalidConfiguration(
                "concurrency_level must be greater than zero".to_string(),
            ));
        }
        if let Some(loader) = &self.loader {
            if loader.shared && loader.passivation {
                return Err(Error::InvalidConfiguration(
                    "passivation cannot be used with a shared cache loader".to_string(),
                ));
            }
        }
        if let Some(eviction) = &self.eviction {
            if eviction.wake_up_interval.is_zero() {
                return Err(Error::InvalidConfiguration(
                    "eviction wake_up_interval must be greater than zero".to_string(),
                ));
            }
            if eviction.event_queue_size == 0 {
                return Err(Error::InvalidConfiguration(
                    "eviction event_queue_size must be greater than zero".to_string(),
                ));
            }
        }
        if self.use_repl_queue && self.cache_mode.is_synchronous() {
            warn!(mode = ?self.cache_mode, "replication queue ignored for synchronous cache mode");
        }
        if self.node_locking_scheme == NodeLockingScheme::Optimistic {
            warn!("optimistic locking is deprecated, using MVCC");
        }
        let effective = self.isolation_level.effective_for(self.node_locking_scheme);
        if effective != self.isolation_level {
            warn!(
                configured = %self.isolation_level,
                effective = %effective,
                "isolation level not supported by MVCC, adjusted"
            );
        }
        Ok(())
    }

    /// Locking scheme actually used
    pub fn locking_scheme(&self) -> NodeLockingScheme {
        self.node_locking_scheme.effective()
    }

    /// Isolation level actually enforced
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation_level.effective_for(self.node_locking_scheme)
    }

    /// True when asynchronous replication goes through the queue
    pub fn uses_repl_queue(&self) -> bool {
        self.use_repl_queue && self.cache_mode.is_clustered() && !self.cache_mode.is_synchronous()
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// =============================================================================
// Tests
// =============================================================================
