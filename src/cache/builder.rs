//! Cache Builder
//!
//! Validates the configuration, wires the collaborators and assembles the
//! interceptor chain. Every configuration problem surfaces from `build()`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CacheCore, StatusCell, TreeCache};
use crate::adapters::FifoEvictionPolicy;
use crate::config::{CacheConfig, EvictionConfig, InterceptorPosition};
use crate::context::Options;
use crate::domain::ports::{CacheLoader, EvictionPolicy, Transport};
use crate::error::{Error, Result};
use crate::eviction::EvictionManager;
use crate::interceptors::{ChainComponents, ChainFactory, Interceptor, ReplicationQueue};
use crate::lock::{LockStrategy, MvccLockManager, PessimisticLockManager};
use crate::notifier::Notifier;
use crate::stats::CacheStatistics;
use crate::transaction::{Address, TransactionManager, TransactionTable};
use crate::tree::DataContainer;

/// Builds a [`TreeCache`]
pub struct CacheBuilder {
    config: CacheConfig,
    loader: Option<Arc<dyn CacheLoader>>,
    transport: Option<Arc<dyn Transport>>,
    eviction_policy: Option<Box<dyn EvictionPolicy>>,
    notifier: Arc<Notifier>,
    factory: ChainFactory,
}

impl CacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            loader: None,
            transport: None,
            eviction_policy: None,
            notifier: Arc::new(Notifier::new()),
            factory: ChainFactory::new(),
        }
    }

    /// Persistence collaborator; a loader without a `loader` section uses
    /// the default loader settings
    pub fn with_loader(mut self, loader: Arc<dyn CacheLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Group communication collaborator, required by clustered modes
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Eviction policy; defaults to FIFO bounded by `eviction.max_nodes`
    pub fn with_eviction_policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.eviction_policy = Some(Box::new(policy));
        self
    }

    /// Notifier shared with other components, e.g. to subscribe before start
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Make `interceptor` available to `custom_interceptors` entries
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.factory.register(interceptor);
        self
    }

    /// Place `interceptor` in the chain at `position`
    pub fn with_custom_interceptor(mut self, interceptor: Arc<dyn Interceptor>, position: InterceptorPosition) -> Self {
        self.factory.add_custom(interceptor, position);
        self
    }

    pub fn build(self) -> Result<TreeCache> {
        let CacheBuilder {
            config,
            loader,
            transport,
            eviction_policy,
            notifier,
            factory,
        } = self;
        config.validate()?;

        let address = transport
            .as_ref()
            .map(|transport| transport.local_address())
            .unwrap_or_else(Address::random);
        let container = Arc::new(DataContainer::new());

        let scheme = config.locking_scheme();
        let locks = if scheme.is_mvcc() {
            LockStrategy::Mvcc(MvccLockManager::new(config.concurrency_level))
        } else {
            LockStrategy::Pessimistic(PessimisticLockManager::new(Arc::clone(&container)))
        };

        let statistics = if config.expose_management_statistics {
            Some(Arc::new(CacheStatistics::new()?))
        } else {
            None
        };

        let repl_queue = match (&transport, config.uses_repl_queue()) {
            (Some(transport), true) => Some(Arc::new(ReplicationQueue::new(
                Arc::clone(transport),
                config.repl_queue_max_elements,
                config.sync_repl_timeout,
            ))),
            _ => None,
        };

        let eviction = match (&config.eviction, eviction_policy) {
            (Some(eviction_config), policy) => {
                let policy = policy.unwrap_or_else(|| Box::new(FifoEvictionPolicy::new(eviction_config.max_nodes)));
                Some(Arc::new(EvictionManager::new(policy, eviction_config.event_queue_size)))
            }
            (None, Some(_)) => {
                return Err(Error::InvalidConfiguration(
                    "an eviction policy was supplied without an eviction section".to_string(),
                ))
            }
            (None, None) => None,
        };

        let status = Arc::new(StatusCell::default());
        let transaction_manager = Arc::new(TransactionManager::new(address));
        let transaction_table = Arc::new(TransactionTable::new());

        let components = ChainComponents {
            config: config.clone(),
            container: Arc::clone(&container),
            locks: locks.clone(),
            status: Arc::clone(&status),
            notifier: Arc::clone(&notifier),
            transaction_manager: Arc::clone(&transaction_manager),
            transaction_table: Arc::clone(&transaction_table),
            statistics: statistics.clone(),
            loader,
            transport: transport.clone(),
            repl_queue: repl_queue.clone(),
            eviction_events: eviction.as_ref().map(|eviction| eviction.sender()),
        };
        let chain = factory.build(&components)?;

        if let Some(eviction) = &eviction {
            debug!(policy = %eviction.policy_name(), "eviction enabled");
        }
        if config.eviction.as_ref().is_some_and(|e: &EvictionConfig| e.max_nodes == 0) {
            warn!("eviction max_nodes is 0, the default policy will never evict");
        }
        info!(
            address = %address,
            locking = locks.name(),
            isolation = %config.isolation(),
            mode = ?config.cache_mode,
            "cache built"
        );

        Ok(TreeCache {
            core: Arc::new(CacheCore {
                config,
                address,
                container,
                locks,
                status,
                notifier,
                transaction_manager,
                transaction_table,
                statistics,
                transport,
                repl_queue,
                eviction,
                chain,
                background: Mutex::new(None),
            }),
            options: Options::default(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
