//! Interceptor Chain Factory
//!
//! Assembles the pipeline from the configuration and the collaborators the
//! cache was built with. The default order is fixed (see the module docs of
//! [`crate::interceptors`]); custom interceptors are then spliced in, in the
//! order they were declared. Every placement problem is reported here, at
//! build time.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::Sender;
use tracing::{debug, info};

use super::{
    CacheLoaderInterceptor, CacheMgmtInterceptor, CacheStoreInterceptor, CallInterceptor, EvictionInterceptor,
    Interceptor, InterceptorChain, InvalidationInterceptor, InvocationContextInterceptor, MvccLockingInterceptor,
    NotificationInterceptor, PassivationInterceptor, PessimisticLockInterceptor, ReplicationInterceptor,
    ReplicationQueue, TxInterceptor, ViewKind,
};
use crate::cache::StatusCell;
use crate::config::{CacheConfig, InterceptorPosition, IsolationLevel};
use crate::domain::ports::{CacheLoader, EvictionEvent, Transport};
use crate::error::{Error, Result};
use crate::lock::LockStrategy;
use crate::notifier::Notifier;
use crate::stats::CacheStatistics;
use crate::transaction::{TransactionManager, TransactionTable};
use crate::tree::DataContainer;

/// Everything the interceptors are wired to
#[derive(Clone)]
pub struct ChainComponents {
    pub config: CacheConfig,
    pub container: Arc<DataContainer>,
    pub locks: LockStrategy,
    pub status: Arc<StatusCell>,
    pub notifier: Arc<Notifier>,
    pub transaction_manager: Arc<TransactionManager>,
    pub transaction_table: Arc<TransactionTable>,
    pub statistics: Option<Arc<CacheStatistics>>,
    pub loader: Option<Arc<dyn CacheLoader>>,
    pub transport: Option<Arc<dyn Transport>>,
    pub repl_queue: Option<Arc<ReplicationQueue>>,
    pub eviction_events: Option<Sender<EvictionEvent>>,
}

/// Builds [`InterceptorChain`]s
#[derive(Default)]
pub struct ChainFactory {
    /// Interceptors that configuration may place by name
    registered: HashMap<String, Arc<dyn Interceptor>>,
    /// Interceptors placed programmatically
    custom: Vec<(Arc<dyn Interceptor>, InterceptorPosition)>,
}

impl ChainFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `interceptor` available to `custom_interceptors` entries
    pub fn register(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.registered.insert(interceptor.name().to_string(), interceptor);
    }

    /// Place `interceptor` at `position`
    pub fn add_custom(&mut self, interceptor: Arc<dyn Interceptor>, position: InterceptorPosition) {
        self.custom.push((interceptor, position));
    }

    /// Assemble the chain for `components`
    pub fn build(&self, components: &ChainComponents) -> Result<InterceptorChain> {
        let mut interceptors = Self::defaults(components)?;

        let configured = components
            .config
            .custom_interceptors
            .iter()
            .map(|custom| {
                self.registered
                    .get(&custom.name)
                    .map(|interceptor| (Arc::clone(interceptor), custom.position.clone()))
                    .ok_or_else(|| {
                        Error::InvalidConfiguration(format!("no interceptor registered as {}", custom.name))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        for (interceptor, position) in configured.iter().chain(self.custom.iter()) {
            let index = Self::resolve(&interceptors, position)?;
            debug!(interceptor = interceptor.name(), index, "custom interceptor placed");
            interceptors.insert(index, Arc::clone(interceptor));
        }

        let chain = InterceptorChain::new(interceptors);
        info!(
            interceptors = chain.len(),
            scheme = %components.config.locking_scheme(),
            mode = ?components.config.cache_mode,
            "interceptor chain assembled"
        );
        debug!(chain = ?chain, "chain order");
        Ok(chain)
    }

    /// Insertion index for `position`; nothing may follow the call
    /// interceptor
    fn resolve(interceptors: &[Arc<dyn Interceptor>], position: &InterceptorPosition) -> Result<usize> {
        let last = interceptors.len().saturating_sub(1);
        let find = |name: &str| {
            interceptors
                .iter()
                .position(|i| i.name() == name)
                .ok_or_else(|| Error::InvalidConfiguration(format!("no interceptor named {} in the chain", name)))
        };

        let index = match position {
            InterceptorPosition::First => 0,
            InterceptorPosition::Last => last,
            InterceptorPosition::Index(index) => *index,
            InterceptorPosition::Before(name) => find(name)?,
            InterceptorPosition::After(name) => find(name)? + 1,
        };
        if index > last {
            return Err(Error::InvalidConfiguration(format!(
                "interceptor index {} out of range, must be at most {}",
                index, last
            )));
        }
        Ok(index)
    }

    fn defaults(components: &ChainComponents) -> Result<Vec<Arc<dyn Interceptor>>> {
        let config = &components.config;
        let scheme = config.locking_scheme();
        let isolation = config.isolation();
        let mvcc = scheme.is_mvcc();
        let container = &components.container;
        let notifier = &components.notifier;

        let mut chain: Vec<Arc<dyn Interceptor>> =
            vec![Arc::new(InvocationContextInterceptor::new(Arc::clone(&components.status)))];

        if config.expose_management_statistics {
            if let Some(statistics) = &components.statistics {
                chain.push(Arc::new(CacheMgmtInterceptor::new(Arc::clone(statistics))));
            }
        }

        chain.push(Arc::new(TxInterceptor::new(
            Arc::clone(&components.transaction_manager),
            Arc::clone(&components.transaction_table),
            Arc::clone(notifier),
            config.lock_acquisition_timeout,
        )));
        chain.push(Arc::new(NotificationInterceptor::new(Arc::clone(notifier))));

        if config.cache_mode.is_clustered() {
            let transport = components.transport.clone().ok_or_else(|| {
                Error::InvalidConfiguration(format!("cache mode {:?} requires a transport", config.cache_mode))
            })?;
            let mode = config.cache_mode.delivery_mode();
            if config.cache_mode.is_replicated() {
                chain.push(Arc::new(ReplicationInterceptor::new(
                    transport,
                    mode,
                    config.sync_repl_timeout,
                    components.repl_queue.clone(),
                )));
            } else {
                chain.push(Arc::new(InvalidationInterceptor::new(
                    transport,
                    mode,
                    config.sync_repl_timeout,
                )));
            }
        }

        let loader = match (&components.loader, &config.loader) {
            (Some(loader), Some(loader_config)) => Some((Arc::clone(loader), loader_config.clone())),
            (Some(loader), None) => Some((Arc::clone(loader), Default::default())),
            (None, Some(_)) => {
                return Err(Error::InvalidConfiguration(
                    "a loader section is configured but no cache loader was supplied".to_string(),
                ))
            }
            (None, None) => None,
        };
        let loader_interceptor = loader.as_ref().map(|(loader, loader_config)| -> Arc<dyn Interceptor> {
            if loader_config.passivation {
                Arc::new(CacheLoaderInterceptor::activating(
                    Arc::clone(loader),
                    Arc::clone(container),
                    Arc::clone(notifier),
                ))
            } else {
                Arc::new(CacheLoaderInterceptor::new(
                    Arc::clone(loader),
                    Arc::clone(container),
                    Arc::clone(notifier),
                ))
            }
        });

        // Read-through precedes locking under MVCC and follows it otherwise
        if mvcc {
            chain.extend(loader_interceptor.clone());
        }
        chain.push(Self::lock_interceptor(components, isolation)?);
        if !mvcc {
            chain.extend(loader_interceptor);
        }

        if let Some((loader, loader_config)) = &loader {
            if loader_config.passivation {
                chain.push(Arc::new(PassivationInterceptor::new(
                    Arc::clone(loader),
                    Arc::clone(container),
                    Arc::clone(notifier),
                )));
            } else {
                chain.push(Arc::new(CacheStoreInterceptor::new(
                    Arc::clone(loader),
                    loader_config.shared,
                    loader_config.ignore_modifications,
                )));
            }
        }

        if let Some(events) = &components.eviction_events {
            chain.push(Arc::new(EvictionInterceptor::new(events.clone(), Arc::clone(container))));
        }

        let view = if mvcc {
            ViewKind::Mvcc {
                repeatable_read: isolation == IsolationLevel::RepeatableRead,
            }
        } else {
            ViewKind::Pessimistic
        };
        chain.push(Arc::new(CallInterceptor::new(view, Arc::clone(container), Arc::clone(notifier))));
        Ok(chain)
    }

    fn lock_interceptor(components: &ChainComponents, isolation: IsolationLevel) -> Result<Arc<dyn Interceptor>> {
        let config = &components.config;
        match (&components.locks, config.locking_scheme().is_mvcc()) {
            (LockStrategy::Mvcc(_), true) => Ok(Arc::new(MvccLockingInterceptor::new(
                components.locks.clone(),
                Arc::clone(&components.container),
                isolation == IsolationLevel::RepeatableRead,
                config.write_skew_check,
                config.lock_parent_for_child_insert_remove,
            ))),
            (LockStrategy::Pessimistic(manager), false) => Ok(Arc::new(PessimisticLockInterceptor::new(
                manager.clone(),
                Arc::clone(&components.container),
                isolation,
                config.lock_parent_for_child_insert_remove,
            ))),
            (locks, _) => Err(Error::InvalidConfiguration(format!(
                "{} lock strategy does not match the {} locking scheme",
                locks.name(),
                config.locking_scheme()
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCacheLoader, InMemoryCluster};
    use crate::commands::{Command, CommandResult};
    use crate::config::{CacheMode, CustomInterceptorConfig, LoaderConfig, NodeLockingScheme};
    use crate::context::InvocationContext;
    use crate::interceptors::Next;
    use crate::lock::{MvccLockManager, PessimisticLockManager};
    use crate::transaction::Address;
    use assert_matches::assert_matches;

    struct Audit;

    impl Interceptor for Audit {
        fn name(&self) -> &str {
            "Audit"
        }

        fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
            next.invoke(ctx, command)
        }
    }

    fn components(config: CacheConfig) -> ChainComponents {
        let container = Arc::new(DataContainer::new());
        let locks = if config.locking_scheme().is_mvcc() {
            LockStrategy::Mvcc(MvccLockManager::new(config.concurrency_level))
        } else {
            LockStrategy::Pessimistic(PessimisticLockManager::new(Arc::clone(&container)))
        };
        ChainComponents {
            config,
            container,
            locks,
            status: Arc::new(StatusCell::default()),
            notifier: Arc::new(Notifier::new()),
            transaction_manager: Arc::new(TransactionManager::new(Address::random())),
            transaction_table: Arc::new(TransactionTable::new()),
            statistics: None,
            loader: None,
            transport: None,
            repl_queue: None,
            eviction_events: None,
        }
    }

    #[test]
    fn test_default_local_chain() {
        let chain = ChainFactory::new().build(&components(CacheConfig::default())).unwrap();
        assert_eq!(
            chain.names(),
            vec![
                "InvocationContextInterceptor",
                "TxInterceptor",
                "NotificationInterceptor",
                "MvccLockingInterceptor",
                "CallInterceptor",
            ]
        );
    }

    #[test]
    fn test_loader_position_depends_on_scheme() {
        for (scheme, loader_before_lock) in [(NodeLockingScheme::Mvcc, true), (NodeLockingScheme::Pessimistic, false)] {
            let config = CacheConfig {
                node_locking_scheme: scheme,
                loader: Some(LoaderConfig::default()),
                ..CacheConfig::default()
            };
            let mut components = components(config);
            components.loader = Some(Arc::new(InMemoryCacheLoader::new()));
            let chain = ChainFactory::new().build(&components).unwrap();

            let loader = chain.position("CacheLoaderInterceptor").unwrap();
            let lock = chain
                .position("MvccLockingInterceptor")
                .or_else(|| chain.position("PessimisticLockInterceptor"))
                .unwrap();
            assert_eq!(loader < lock, loader_before_lock, "{}", scheme);
            assert_eq!(chain.position("CacheStoreInterceptor"), Some(chain.len() - 2));
        }
    }

    #[test]
    fn test_passivation_chain() {
        let config = CacheConfig {
            loader: Some(LoaderConfig {
                passivation: true,
                ..LoaderConfig::default()
            }),
            ..CacheConfig::default()
        };
        let mut components = components(config);
        components.loader = Some(Arc::new(InMemoryCacheLoader::new()));
        let chain = ChainFactory::new().build(&components).unwrap();
        assert!(chain.contains("ActivationInterceptor"));
        assert!(chain.contains("PassivationInterceptor"));
        assert!(!chain.contains("CacheStoreInterceptor"));
    }

    #[test]
    fn test_clustered_modes() {
        let cluster = InMemoryCluster::new();
        for (mode, name) in [
            (CacheMode::ReplSync, "ReplicationInterceptor"),
            (CacheMode::InvalidationAsync, "InvalidationInterceptor"),
        ] {
            let mut components = components(CacheConfig {
                cache_mode: mode,
                ..CacheConfig::default()
            });
            assert_matches!(ChainFactory::new().build(&components), Err(Error::InvalidConfiguration(_)));

            components.transport = Some(cluster.join() as Arc<dyn Transport>);
            let chain = ChainFactory::new().build(&components).unwrap();
            assert_eq!(chain.position(name), Some(3));
        }
    }

    #[test]
    fn test_custom_positions() {
        let cases = [
            (InterceptorPosition::First, 0),
            (InterceptorPosition::Last, 4),
            (InterceptorPosition::Index(2), 2),
            (InterceptorPosition::Before("TxInterceptor".into()), 1),
            (InterceptorPosition::After("TxInterceptor".into()), 2),
        ];
        for (position, expected) in cases {
            let mut factory = ChainFactory::new();
            factory.add_custom(Arc::new(Audit), position.clone());
            let chain = factory.build(&components(CacheConfig::default())).unwrap();
            assert_eq!(chain.position("Audit"), Some(expected), "{:?}", position);
            assert_eq!(chain.names().last().map(String::as_str), Some("CallInterceptor"));
        }
    }

    #[test]
    fn test_custom_placement_errors() {
        for position in [
            InterceptorPosition::Index(5),
            InterceptorPosition::After("CallInterceptor".into()),
            InterceptorPosition::Before("NoSuchInterceptor".into()),
        ] {
            let mut factory = ChainFactory::new();
            factory.add_custom(Arc::new(Audit), position);
            assert_matches!(
                factory.build(&components(CacheConfig::default())),
                Err(Error::InvalidConfiguration(_))
            );
        }
    }

    #[test]
    fn test_configured_custom_resolved_by_name() {
        let config = CacheConfig {
            custom_interceptors: vec![CustomInterceptorConfig {
                name: "Audit".into(),
                position: InterceptorPosition::First,
            }],
            ..CacheConfig::default()
        };
        assert_matches!(
            ChainFactory::new().build(&components(config.clone())),
            Err(Error::InvalidConfiguration(_))
        );

        let mut factory = ChainFactory::new();
        factory.register(Arc::new(Audit));
        let chain = factory.build(&components(config)).unwrap();
        assert_eq!(chain.position("Audit"), Some(0));
    }
}
