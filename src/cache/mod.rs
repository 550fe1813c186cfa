//! Tree Cache
//!
//! Public entry point. Every operation is turned into a [`Command`] and run
//! through the interceptor chain assembled when the cache was built.
//!
//! # Example
//!
//! ```ignore
//! use treecache::{CacheBuilder, CacheConfig, Fqn};
//! use serde_json::json;
//!
//! let cache = CacheBuilder::new(CacheConfig::default()).build()?;
//! cache.start()?;
//!
//! let fqn = Fqn::from_string("/users/42");
//! cache.put(&fqn, "name", json!("Ada"))?;
//! assert_eq!(cache.get(&fqn, "name")?, Some(json!("Ada")));
//!
//! let tm = cache.transaction_manager();
//! tm.begin()?;
//! cache.remove_node(&fqn)?;
//! tm.rollback()?;
//! assert!(cache.exists(&fqn)?);
//! ```

mod builder;
mod lifecycle;
mod remote;

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use builder::CacheBuilder;
pub use lifecycle::{ComponentStatus, StatusCell};

use crate::commands::{Command, CommandResult};
use crate::config::CacheConfig;
use crate::context::{InvocationContext, Options};
use crate::domain::events::CacheEvent;
use crate::domain::ports::{RemoteCommandHandler, Transport};
use crate::error::{Error, Result};
use crate::eviction::EvictionManager;
use crate::fqn::{Fqn, FqnElement};
use crate::interceptors::{InterceptorChain, ReplicationQueue};
use crate::lock::{LockManager, LockStrategy};
use crate::notifier::Notifier;
use crate::stats::{CacheStatistics, StatisticsSnapshot};
use crate::transaction::{Address, TransactionManager, TransactionTable};
use crate::tree::{DataContainer, NodeData, NodeSnapshot, Value};

/// Grace period for background tasks on stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Background tasks of a started cache
struct Background {
    runtime: Runtime,
    token: CancellationToken,
}

/// Shared state behind every [`TreeCache`] handle
pub(crate) struct CacheCore {
    config: CacheConfig,
    address: Address,
    container: Arc<DataContainer>,
    locks: LockStrategy,
    status: Arc<StatusCell>,
    notifier: Arc<Notifier>,
    transaction_manager: Arc<TransactionManager>,
    transaction_table: Arc<TransactionTable>,
    statistics: Option<Arc<CacheStatistics>>,
    transport: Option<Arc<dyn Transport>>,
    repl_queue: Option<Arc<ReplicationQueue>>,
    eviction: Option<Arc<EvictionManager>>,
    chain: InterceptorChain,
    background: Mutex<Option<Background>>,
}

impl CacheCore {
    fn invoke(&self, options: Options, command: &Command) -> Result<CommandResult> {
        let mut ctx = InvocationContext::new(options, self.config.lock_acquisition_timeout);
        self.chain.invoke(&mut ctx, command)
    }

    /// Eviction entry point for the background timer
    fn evict_for_policy(&self, fqn: &Fqn) -> Result<bool> {
        let options = Options::default().lock_acquisition_timeout(Duration::ZERO);
        self.invoke(
            options,
            &Command::Evict {
                fqn: fqn.clone(),
                recursive: false,
            },
        )
        .map(CommandResult::into_bool)
    }
}

/// Handle to a tree cache
///
/// Cloning is cheap; clones share the cache and carry their own
/// [`Options`].
#[derive(Clone)]
pub struct TreeCache {
    core: Arc<CacheCore>,
    options: Options,
}

impl TreeCache {
    fn invoke(&self, command: Command) -> Result<CommandResult> {
        self.core.invoke(self.options.clone(), &command)
    }

    /// Handle whose invocations carry `options`
    pub fn with_options(&self, options: Options) -> TreeCache {
        TreeCache {
            core: Arc::clone(&self.core),
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` under `key`; returns the previous value
    pub fn put(&self, fqn: &Fqn, key: impl Into<String>, value: Value) -> Result<Option<Value>> {
        self.invoke(Command::PutKeyValue {
            fqn: fqn.clone(),
            key: key.into(),
            value,
        })
        .map(CommandResult::into_value)
    }

    /// Merge `data` into the node, creating it if needed
    pub fn put_all(&self, fqn: &Fqn, data: NodeData) -> Result<()> {
        self.invoke(Command::Put {
            fqn: fqn.clone(),
            data,
            erase: false,
        })
        .map(|_| ())
    }

    /// Replace the node's data with `data`
    pub fn replace_all(&self, fqn: &Fqn, data: NodeData) -> Result<()> {
        self.invoke(Command::Put {
            fqn: fqn.clone(),
            data,
            erase: true,
        })
        .map(|_| ())
    }

    /// Store a value read from an external source
    ///
    /// Never overwrites an existing value, never waits for a lock, runs
    /// outside any transaction and never fails.
    pub fn put_for_external_read(&self, fqn: &Fqn, key: impl Into<String>, value: Value) {
        let options = self
            .options
            .clone()
            .fail_silently()
            .lock_acquisition_timeout(Duration::ZERO);
        let command = Command::PutForExternalRead {
            fqn: fqn.clone(),
            key: key.into(),
            value,
        };
        if let Err(e) = self.core.invoke(options, &command) {
            debug!(fqn = %fqn, error = %e, "external read not cached");
        }
    }

    /// Remove `key`; returns the removed value
    pub fn remove(&self, fqn: &Fqn, key: &str) -> Result<Option<Value>> {
        self.invoke(Command::RemoveKey {
            fqn: fqn.clone(),
            key: key.to_string(),
        })
        .map(CommandResult::into_value)
    }

    /// Remove the node and its subtree; false if it did not exist
    pub fn remove_node(&self, fqn: &Fqn) -> Result<bool> {
        self.invoke(Command::RemoveNode { fqn: fqn.clone() })
            .map(CommandResult::into_bool)
    }

    /// Remove every key of the node
    pub fn clear_data(&self, fqn: &Fqn) -> Result<bool> {
        self.invoke(Command::ClearData { fqn: fqn.clone() })
            .map(CommandResult::into_bool)
    }

    /// Move the subtree at `fqn` under `new_parent`
    pub fn move_node(&self, fqn: &Fqn, new_parent: &Fqn) -> Result<()> {
        self.invoke(Command::Move {
            from: fqn.clone(),
            to_parent: new_parent.clone(),
        })
        .map(|_| ())
    }

    /// Drop the node (and its subtree when `recursive`) from memory
    ///
    /// Resident nodes are skipped. With passivation the data is written to
    /// the cache loader first.
    pub fn evict(&self, fqn: &Fqn, recursive: bool) -> Result<bool> {
        self.invoke(Command::Evict {
            fqn: fqn.clone(),
            recursive,
        })
        .map(CommandResult::into_bool)
    }

    /// Exempt the node from eviction, or make it evictable again
    pub fn set_resident(&self, fqn: &Fqn, resident: bool) -> Result<bool> {
        self.check_started()?;
        match self.core.container.peek_strict(fqn) {
            Some(node) => {
                node.write().set_resident(resident);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, fqn: &Fqn, key: &str) -> Result<Option<Value>> {
        self.invoke(Command::Get {
            fqn: fqn.clone(),
            key: key.to_string(),
        })
        .map(CommandResult::into_value)
    }

    pub fn get_data(&self, fqn: &Fqn) -> Result<Option<NodeData>> {
        self.invoke(Command::GetData { fqn: fqn.clone() })
            .map(CommandResult::into_data)
    }

    pub fn get_keys(&self, fqn: &Fqn) -> Result<Option<BTreeSet<String>>> {
        self.invoke(Command::GetKeys { fqn: fqn.clone() })
            .map(CommandResult::into_keys)
    }

    pub fn get_children_names(&self, fqn: &Fqn) -> Result<Option<BTreeSet<FqnElement>>> {
        self.invoke(Command::GetChildrenNames { fqn: fqn.clone() })
            .map(CommandResult::into_children)
    }

    /// Immutable view of the node
    pub fn get_node(&self, fqn: &Fqn) -> Result<Option<NodeSnapshot>> {
        self.invoke(Command::GetNode { fqn: fqn.clone() })
            .map(CommandResult::into_node)
    }

    pub fn exists(&self, fqn: &Fqn) -> Result<bool> {
        self.invoke(Command::Exists { fqn: fqn.clone() })
            .map(CommandResult::into_bool)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn status(&self) -> ComponentStatus {
        self.core.status.get()
    }

    fn check_started(&self) -> Result<()> {
        let status = self.status();
        if !status.allows_invocations() && !self.options.skip_cache_status_check {
            return Err(Error::InvalidState(format!("cache is {}", status)));
        }
        Ok(())
    }

    /// Start the cache
    ///
    /// Allowed from `Instantiated`, `Stopped` and `Destroyed`. A failure
    /// leaves the cache `Failed`; `stop()` must run before another start.
    pub fn start(&self) -> Result<()> {
        self.core
            .status
            .transition(ComponentStatus::can_start, ComponentStatus::Starting)?;
        info!(address = %self.core.address, "starting cache");

        match self.start_components() {
            Ok(()) => {
                self.core.status.set(ComponentStatus::Started);
                info!(address = %self.core.address, chain = self.core.chain.len(), "cache started");
                Ok(())
            }
            Err(e) => {
                self.core.status.set(ComponentStatus::Failed);
                error!(address = %self.core.address, error = %e, "cache failed to start");
                Err(e)
            }
        }
    }

    fn start_components(&self) -> Result<()> {
        let core = &self.core;
        core.container.start();

        if let Some(transport) = &core.transport {
            let handler: Arc<dyn RemoteCommandHandler> = Arc::clone(core) as Arc<dyn RemoteCommandHandler>;
            transport.start(Arc::downgrade(&handler))?;
            debug!(members = transport.members().len(), "transport started");
        }

        self.start_background()?;
        core.notifier.notify(&CacheEvent::cache_started())
    }

    fn start_background(&self) -> Result<()> {
        let core = &self.core;
        let queue = core.repl_queue.clone().filter(|_| core.config.uses_repl_queue());
        if core.eviction.is_none() && queue.is_none() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("treecache-background")
            .enable_time()
            .build()?;
        let token = CancellationToken::new();

        if let Some(queue) = queue {
            runtime.spawn(queue.run(core.config.repl_queue_interval, token.child_token()));
        }
        if let (Some(eviction), Some(eviction_config)) = (&core.eviction, &core.config.eviction) {
            let weak: Weak<CacheCore> = Arc::downgrade(core);
            let evict = move |fqn: &Fqn| match weak.upgrade() {
                Some(core) => core.evict_for_policy(fqn),
                None => Ok(false),
            };
            runtime.spawn(Arc::clone(eviction).run(evict, eviction_config.wake_up_interval, token.child_token()));
        }

        *core.background.lock() = Some(Background { runtime, token });
        Ok(())
    }

    /// Stop the cache
    ///
    /// Cancels background tasks, flushes queued replication and leaves the
    /// group. A no-op unless the cache is `Started` or `Failed`. Safe to call
    /// from async code; background tasks are then cancelled but not awaited.
    pub fn stop(&self) -> Result<()> {
        let core = &self.core;
        let previous = match core
            .status
            .transition(ComponentStatus::can_stop, ComponentStatus::Stopping)
        {
            Ok(previous) => previous,
            Err(_) => {
                debug!(status = %self.status(), "stop ignored");
                return Ok(());
            }
        };
        info!(address = %core.address, "stopping cache");

        if let Some(background) = core.background.lock().take() {
            background.token.cancel();
            if tokio::runtime::Handle::try_current().is_ok() {
                // Blocking on shutdown panics inside an async context
                debug!("stopping from an async context, background tasks are not awaited");
                background.runtime.shutdown_background();
            } else {
                background.runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
            }
        }
        if let Some(queue) = &core.repl_queue {
            queue.flush();
        }
        if let Some(transport) = &core.transport {
            transport.stop();
        }

        let notified = if previous == ComponentStatus::Started {
            core.notifier.notify(&CacheEvent::cache_stopped())
        } else {
            Ok(())
        };
        core.container.stop();

        match notified {
            Ok(()) => {
                core.status.set(ComponentStatus::Stopped);
                info!(address = %core.address, "cache stopped");
                Ok(())
            }
            Err(e) => {
                core.status.set(ComponentStatus::Failed);
                warn!(address = %core.address, error = %e, "cache stop failed");
                Err(e)
            }
        }
    }

    /// Stop the cache and drop its contents
    pub fn destroy(&self) -> Result<()> {
        self.stop()?;
        if self.status() == ComponentStatus::Failed {
            return Err(Error::InvalidState("cannot destroy a failed cache".to_string()));
        }
        self.core.container.clear();
        self.core.status.set(ComponentStatus::Destroyed);
        info!(address = %self.core.address, "cache destroyed");
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Address of this cache in its group
    pub fn local_address(&self) -> Address {
        self.core.address
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    /// Nodes in memory, root included; -1 before the first start
    pub fn number_of_nodes(&self) -> i64 {
        self.core.container.number_of_nodes()
    }

    /// Keys stored in memory across all nodes
    pub fn number_of_attributes(&self) -> usize {
        self.core.container.total_attributes()
    }

    pub fn number_of_locks_held(&self) -> usize {
        self.core.locks.number_of_locks_held()
    }

    /// Name of the lock strategy in use
    pub fn locking_scheme(&self) -> &'static str {
        self.core.locks.name()
    }

    /// Lock manager, for inspecting who holds what
    pub fn lock_manager(&self) -> &LockStrategy {
        &self.core.locks
    }

    /// Indented dump of the tree
    pub fn print_details(&self) -> String {
        self.core.container.print_details()
    }

    /// The assembled interceptor chain
    pub fn interceptor_chain(&self) -> &InterceptorChain {
        &self.core.chain
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.core.notifier
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.core.transaction_manager
    }

    /// Transactions this cache currently takes part in
    pub fn transaction_count(&self) -> usize {
        self.core.transaction_table.len()
    }

    /// Statistics snapshot; `None` when management statistics are disabled
    pub fn statistics(&self) -> Option<StatisticsSnapshot> {
        self.core.statistics.as_ref().map(|statistics| statistics.snapshot())
    }

    pub fn reset_statistics(&self) {
        if let Some(statistics) = &self.core.statistics {
            statistics.reset();
        }
    }

    /// Prometheus text exposition of the statistics
    pub fn render_metrics(&self) -> Result<String> {
        match &self.core.statistics {
            Some(statistics) => statistics.render(),
            None => Err(Error::InvalidState("management statistics are disabled".to_string())),
        }
    }

    /// Run one eviction round now; returns the number of nodes evicted
    pub fn process_eviction(&self) -> usize {
        match &self.core.eviction {
            Some(eviction) => eviction.process(|fqn| self.core.evict_for_policy(fqn)),
            None => 0,
        }
    }
}

impl std::fmt::Debug for TreeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCache")
            .field("address", &self.core.address)
            .field("status", &self.status())
            .field("locking", &self.core.locks.name())
            .field("nodes", &self.number_of_nodes())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheMode, NodeLockingScheme};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn started(scheme: NodeLockingScheme) -> TreeCache {
        let config = CacheConfig {
            node_locking_scheme: scheme,
            lock_acquisition_timeout: Duration::from_millis(200),
            ..CacheConfig::default()
        };
        let cache = CacheBuilder::new(config).build().unwrap();
        cache.start().unwrap();
        cache
    }

    fn fqn(s: &str) -> Fqn {
        Fqn::from_string(s)
    }

    #[test]
    fn test_basic_operations_both_schemes() {
        for scheme in [NodeLockingScheme::Mvcc, NodeLockingScheme::Pessimistic] {
            let cache = started(scheme);
            let a = fqn("/a/b");

            assert_eq!(cache.put(&a, "k", json!(1)).unwrap(), None);
            assert_eq!(cache.put(&a, "k", json!(2)).unwrap(), Some(json!(1)));
            assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(2)));
            assert!(cache.exists(&fqn("/a")).unwrap());
            assert_eq!(cache.number_of_nodes(), 3);
            assert_eq!(cache.get_children_names(&fqn("/a")).unwrap().unwrap().len(), 1);

            assert_eq!(cache.remove(&a, "k").unwrap(), Some(json!(2)));
            assert!(cache.remove_node(&fqn("/a")).unwrap());
            assert!(!cache.exists(&a).unwrap());
            assert_eq!(cache.number_of_locks_held(), 0);
        }
    }

    #[test]
    fn test_operations_require_started_cache() {
        let cache = CacheBuilder::new(CacheConfig::default()).build().unwrap();
        assert_eq!(cache.status(), ComponentStatus::Instantiated);
        assert_eq!(cache.number_of_nodes(), -1);
        assert_matches!(cache.get(&fqn("/a"), "k"), Err(Error::InvalidState(_)));

        cache.start().unwrap();
        cache.put(&fqn("/a"), "k", json!(1)).unwrap();
        cache.stop().unwrap();
        assert_eq!(cache.status(), ComponentStatus::Stopped);
        assert_matches!(cache.put(&fqn("/a"), "k", json!(1)), Err(Error::InvalidState(_)));

        cache.start().unwrap();
        assert_eq!(cache.get(&fqn("/a"), "k").unwrap(), Some(json!(1)));
        cache.destroy().unwrap();
        assert_eq!(cache.status(), ComponentStatus::Destroyed);
    }

    #[test]
    fn test_failed_start_requires_stop() {
        let cache = CacheBuilder::new(CacheConfig::default()).build().unwrap();
        cache
            .notifier()
            .add_listener(
                &[crate::domain::events::EventKind::CacheStarted],
                Arc::new(|_: &CacheEvent| -> anyhow::Result<()> { anyhow::bail!("refused") }),
            );

        assert_matches!(cache.start(), Err(Error::Lifecycle(_)));
        assert_eq!(cache.status(), ComponentStatus::Failed);
        assert_matches!(cache.start(), Err(Error::InvalidState(_)));
        cache.stop().unwrap();
        assert_eq!(cache.status(), ComponentStatus::Stopped);
    }

    #[test]
    fn test_put_for_external_read_never_overwrites() {
        let cache = started(NodeLockingScheme::Mvcc);
        let a = fqn("/a");
        cache.put_for_external_read(&a, "k", json!(1));
        cache.put_for_external_read(&a, "k", json!(2));
        assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_set_resident_and_evict() {
        let cache = started(NodeLockingScheme::Pessimistic);
        let a = fqn("/a");
        cache.put(&a, "k", json!(1)).unwrap();

        assert!(cache.set_resident(&a, true).unwrap());
        cache.evict(&a, false).unwrap();
        assert!(cache.exists(&a).unwrap());

        cache.set_resident(&a, false).unwrap();
        assert!(cache.evict(&a, false).unwrap());
        assert!(!cache.exists(&a).unwrap());
        assert!(!cache.set_resident(&fqn("/missing"), true).unwrap());
    }

    #[test]
    fn test_with_options_skips_status_check() {
        let cache = CacheBuilder::new(CacheConfig::default()).build().unwrap();
        let relaxed = cache.with_options(Options::default().skip_cache_status_check());
        assert!(relaxed.options().skip_cache_status_check);
        assert_matches!(cache.exists(&fqn("/a")), Err(Error::InvalidState(_)));
    }

    #[test]
    fn test_statistics_and_metrics() {
        let cache = started(NodeLockingScheme::Mvcc);
        let a = fqn("/a");
        cache.put(&a, "k", json!(1)).unwrap();
        cache.get(&a, "k").unwrap();
        cache.get(&a, "missing").unwrap();

        let snapshot = cache.statistics().unwrap();
        assert_eq!(snapshot.stores, 1);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert!(cache.render_metrics().unwrap().contains("treecache_hits_total"));

        cache.reset_statistics();
        assert_eq!(cache.statistics().unwrap().stores, 0);
    }

    #[tokio::test]
    async fn test_stop_and_destroy_from_async_context() {
        let config = CacheConfig {
            eviction: Some(crate::config::EvictionConfig::default()),
            ..CacheConfig::default()
        };
        let cache = CacheBuilder::new(config).build().unwrap();
        cache.start().unwrap();
        cache.put(&fqn("/a"), "k", json!(1)).unwrap();

        cache.stop().unwrap();
        assert_eq!(cache.status(), ComponentStatus::Stopped);

        cache.start().unwrap();
        assert_eq!(cache.get(&fqn("/a"), "k").unwrap(), Some(json!(1)));
        cache.destroy().unwrap();
        assert_eq!(cache.status(), ComponentStatus::Destroyed);
    }

    #[test]
    fn test_clustered_cache_needs_transport() {
        let config = CacheConfig {
            cache_mode: CacheMode::ReplSync,
            ..CacheConfig::default()
        };
        assert_matches!(CacheBuilder::new(config).build(), Err(Error::InvalidConfiguration(_)));
    }
}
