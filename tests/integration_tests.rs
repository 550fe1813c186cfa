//! TreeCache Integration Tests
//!
//! Exercise the public API end to end through the assembled interceptor
//! chain:
//! - Basic tree operations under both locking schemes
//! - Transactions, isolation and lock bookkeeping
//! - Cache loader read-through, write-through and passivation
//! - Replication and invalidation through the in-process transport
//! - Eviction and notifications

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use treecache::{CacheBuilder, CacheConfig, Fqn, NodeData, NodeLockingScheme, TreeCache, Value};

const SCHEMES: [NodeLockingScheme; 2] = [NodeLockingScheme::Mvcc, NodeLockingScheme::Pessimistic];

fn fqn(s: &str) -> Fqn {
    Fqn::from_string(s)
}

fn data(pairs: &[(&str, Value)]) -> NodeData {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn config(scheme: NodeLockingScheme) -> CacheConfig {
    CacheConfig {
        node_locking_scheme: scheme,
        lock_acquisition_timeout: Duration::from_millis(200),
        ..CacheConfig::default()
    }
}

fn started(config: CacheConfig) -> TreeCache {
    let cache = CacheBuilder::new(config).build().unwrap();
    cache.start().unwrap();
    cache
}

// =============================================================================
// Tree Operations
// =============================================================================

mod tree_cache_tests {
    use super::*;
    use assert_matches::assert_matches;
    use treecache::{Error, FqnElement};

    #[test]
    fn test_put_all_and_replace_all() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            let a = fqn("/a");

            cache.put_all(&a, data(&[("x", json!(1)), ("y", json!(2))])).unwrap();
            cache.put_all(&a, data(&[("z", json!(3))])).unwrap();
            assert_eq!(cache.get_keys(&a).unwrap().unwrap().len(), 3);

            cache.replace_all(&a, data(&[("only", json!(true))])).unwrap();
            assert_eq!(cache.get_data(&a).unwrap(), Some(data(&[("only", json!(true))])));

            assert!(cache.clear_data(&a).unwrap());
            assert_eq!(cache.get_data(&a).unwrap(), Some(NodeData::new()));
            assert!(cache.exists(&a).unwrap());
        }
    }

    #[test]
    fn test_reads_of_missing_nodes() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            let missing = fqn("/missing");
            assert_eq!(cache.get(&missing, "k").unwrap(), None);
            assert_eq!(cache.get_data(&missing).unwrap(), None);
            assert_eq!(cache.get_keys(&missing).unwrap(), None);
            assert_eq!(cache.get_children_names(&missing).unwrap(), None);
            assert_eq!(cache.get_node(&missing).unwrap(), None);
            assert!(!cache.remove_node(&missing).unwrap());
        }
    }

    #[test]
    fn test_get_node_snapshot() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            cache.put(&fqn("/a/b"), "k", json!("v")).unwrap();
            cache.put(&fqn("/a/c"), "k", json!("w")).unwrap();

            let node = cache.get_node(&fqn("/a")).unwrap().unwrap();
            assert_eq!(node.fqn, fqn("/a"));
            assert_eq!(
                node.children,
                [FqnElement::from("b"), FqnElement::from("c")].into_iter().collect()
            );
        }
    }

    #[test]
    fn test_move_node() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            cache.put(&fqn("/src/n/leaf"), "v", json!(1)).unwrap();
            cache.put(&fqn("/dst"), "marker", json!(true)).unwrap();

            cache.move_node(&fqn("/src/n"), &fqn("/dst")).unwrap();
            assert!(!cache.exists(&fqn("/src/n")).unwrap());
            assert_eq!(cache.get(&fqn("/dst/n/leaf"), "v").unwrap(), Some(json!(1)));

            assert_matches!(
                cache.move_node(&fqn("/nowhere"), &fqn("/dst")),
                Err(Error::NodeNotFound(_))
            );
            assert_eq!(cache.number_of_locks_held(), 0);
        }
    }

    #[test]
    fn test_evict_leaf_and_inner_node() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            cache.put(&fqn("/a"), "k", json!(1)).unwrap();
            cache.put(&fqn("/a/b"), "k", json!(2)).unwrap();

            // An inner node keeps its children but loses its data
            assert!(!cache.evict(&fqn("/a"), false).unwrap());
            assert!(cache.exists(&fqn("/a/b")).unwrap());

            assert!(cache.evict(&fqn("/a"), true).unwrap());
            assert!(!cache.exists(&fqn("/a/b")).unwrap());
        }
    }

    #[test]
    fn test_print_details_lists_nodes() {
        let cache = started(config(NodeLockingScheme::Mvcc));
        cache.put(&fqn("/users/ada"), "lang", json!("en")).unwrap();
        let details = cache.print_details();
        assert!(details.contains("users"));
        assert!(details.contains("ada"));
    }
}

// =============================================================================
// Transactions
// =============================================================================

mod transaction_tests {
    use super::*;
    use assert_matches::assert_matches;
    use treecache::{Error, IsolationLevel};

    #[test]
    fn test_commit_and_rollback() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            let tm = cache.transaction_manager();
            let a = fqn("/a/b");

            tm.begin().unwrap();
            cache.put(&a, "k", json!(1)).unwrap();
            assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(1)));
            tm.commit().unwrap();
            assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(1)));

            tm.begin().unwrap();
            cache.put(&a, "k", json!(2)).unwrap();
            cache.put(&fqn("/c"), "k", json!(3)).unwrap();
            tm.rollback().unwrap();

            assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(1)));
            assert!(!cache.exists(&fqn("/c")).unwrap());
            assert_eq!(cache.number_of_locks_held(), 0);
            assert_eq!(cache.transaction_count(), 0);
        }
    }

    #[test]
    fn test_uncommitted_writes_are_invisible_to_others() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            let tm = cache.transaction_manager();
            let a = fqn("/a");
            cache.put(&a, "k", json!("committed")).unwrap();

            tm.begin().unwrap();
            cache.put(&fqn("/other"), "k", json!(1)).unwrap();
            let seen = thread::scope(|s| s.spawn(|| cache.get(&a, "k")).join().unwrap());
            assert_eq!(seen.unwrap(), Some(json!("committed")));
            tm.commit().unwrap();
        }
    }

    #[test]
    fn test_mvcc_reads_do_not_block_on_writers() {
        let cache = started(config(NodeLockingScheme::Mvcc));
        let tm = cache.transaction_manager();
        let a = fqn("/a");
        cache.put(&a, "k", json!(1)).unwrap();

        tm.begin().unwrap();
        cache.put(&a, "k", json!(2)).unwrap();
        let seen = thread::scope(|s| s.spawn(|| cache.get(&a, "k")).join().unwrap());
        assert_eq!(seen.unwrap(), Some(json!(1)));
        tm.commit().unwrap();
        assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_delete_then_recreate_in_one_transaction() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            let tm = cache.transaction_manager();
            cache.put(&fqn("/a/b"), "old", json!(1)).unwrap();
            cache.put(&fqn("/a/sibling"), "s", json!(1)).unwrap();

            tm.begin().unwrap();
            assert!(cache.remove_node(&fqn("/a")).unwrap());
            cache.put(&fqn("/a/b"), "new", json!(2)).unwrap();
            tm.commit().unwrap();

            assert_eq!(cache.get_data(&fqn("/a/b")).unwrap(), Some(data(&[("new", json!(2))])));
            assert!(!cache.exists(&fqn("/a/sibling")).unwrap(), "{:?}", scheme);
            assert_eq!(cache.get_children_names(&fqn("/a")).unwrap().unwrap().len(), 1);
            assert_eq!(cache.number_of_locks_held(), 0);
        }
    }

    #[test]
    fn test_rollback_restores_removed_subtree() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            let tm = cache.transaction_manager();
            cache.put(&fqn("/a/b"), "k", json!(1)).unwrap();

            tm.begin().unwrap();
            cache.remove_node(&fqn("/a")).unwrap();
            assert!(!cache.exists(&fqn("/a/b")).unwrap());
            tm.rollback().unwrap();

            assert_eq!(cache.get(&fqn("/a/b"), "k").unwrap(), Some(json!(1)));
        }
    }

    #[test]
    fn test_rollback_only_transaction_refuses_commit() {
        let cache = started(config(NodeLockingScheme::Mvcc));
        let tm = cache.transaction_manager();

        tm.begin().unwrap();
        cache.put(&fqn("/a"), "k", json!(1)).unwrap();
        tm.set_rollback_only().unwrap();
        assert_matches!(tm.commit(), Err(Error::RollbackOnly(_)));
        assert!(!cache.exists(&fqn("/a")).unwrap());
    }

    #[test]
    fn test_write_skew_check() {
        let cache = started(CacheConfig {
            isolation_level: IsolationLevel::RepeatableRead,
            write_skew_check: true,
            ..config(NodeLockingScheme::Mvcc)
        });
        let tm = cache.transaction_manager();
        let a = fqn("/a");
        cache.put(&a, "k", json!(1)).unwrap();

        tm.begin().unwrap();
        assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(1)));
        thread::scope(|s| s.spawn(|| cache.put(&a, "k", json!(2))).join().unwrap()).unwrap();
        cache.put(&a, "k", json!(3)).unwrap();

        assert_matches!(tm.commit(), Err(Error::InvalidState(_)));
        assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(2)));
        assert_eq!(cache.number_of_locks_held(), 0);
    }

    #[test]
    fn test_suspend_and_resume() {
        let cache = started(config(NodeLockingScheme::Pessimistic));
        let tm = cache.transaction_manager();

        tm.begin().unwrap();
        cache.put(&fqn("/in-tx"), "k", json!(1)).unwrap();
        let suspended = tm.suspend().unwrap();

        // Outside the transaction the write applies immediately
        cache.put(&fqn("/outside"), "k", json!(1)).unwrap();

        tm.resume(suspended).unwrap();
        tm.rollback().unwrap();
        assert!(!cache.exists(&fqn("/in-tx")).unwrap());
        assert!(cache.exists(&fqn("/outside")).unwrap());
    }
}

// =============================================================================
// Locking
// =============================================================================

mod locking_tests {
    use super::*;
    use treecache::lock::{LockManager, LockMode};

    #[test]
    fn test_pessimistic_write_locks_path() {
        let cache = started(config(NodeLockingScheme::Pessimistic));
        let tm = cache.transaction_manager();
        let locks = cache.lock_manager();

        tm.begin().unwrap();
        cache.put(&fqn("/a/b/c"), "k", json!(1)).unwrap();

        assert!(locks.is_locked_in(&fqn("/a/b/c"), LockMode::Write));
        for ancestor in ["/a/b", "/a"] {
            assert!(locks.is_locked_in(&fqn(ancestor), LockMode::Read), "{}", ancestor);
            assert!(!locks.is_locked_in(&fqn(ancestor), LockMode::Write), "{}", ancestor);
        }
        // The root is read-locked as well
        assert_eq!(cache.number_of_locks_held(), 4);

        tm.commit().unwrap();
        assert_eq!(cache.number_of_locks_held(), 0);

        tm.begin().unwrap();
        cache.put(&fqn("/a/b/c"), "k", json!(2)).unwrap();
        tm.rollback().unwrap();
        assert_eq!(cache.number_of_locks_held(), 0);
    }

    #[test]
    fn test_lock_timeout_leaves_no_residual_locks() {
        for scheme in SCHEMES {
            let cache = started(CacheConfig {
                lock_acquisition_timeout: Duration::from_millis(100),
                ..config(scheme)
            });
            let tm = cache.transaction_manager();
            let a = fqn("/a");
            cache.put(&a, "k", json!(0)).unwrap();

            tm.begin().unwrap();
            cache.put(&a, "k", json!(1)).unwrap();
            let held = cache.number_of_locks_held();
            assert!(held > 0);

            thread::scope(|s| {
                s.spawn(|| {
                    tm.begin().unwrap();
                    let error = cache.put(&a, "k", json!(2)).unwrap_err();
                    assert!(error.is_lock_timeout(), "{:?}: {}", scheme, error);
                    assert!(tm.current().unwrap().is_rollback_only());
                    tm.rollback().unwrap();
                })
                .join()
                .unwrap();
            });
            assert_eq!(cache.number_of_locks_held(), held);

            tm.commit().unwrap();
            assert_eq!(cache.number_of_locks_held(), 0);
            assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(1)));
        }
    }

    #[test]
    fn test_non_transactional_writes_release_locks() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            for i in 0..20 {
                cache.put(&fqn(&format!("/n/{}", i)), "k", json!(i)).unwrap();
            }
            cache.remove_node(&fqn("/n")).unwrap();
            assert_eq!(cache.number_of_locks_held(), 0);
        }
    }

    /// Put `sibling` from another thread in its own transaction; true when
    /// the put committed, false when it timed out on a lock
    fn sibling_insert_succeeds(cache: &TreeCache, sibling: &Fqn) -> bool {
        thread::scope(|s| {
            s.spawn(|| {
                let tm = cache.transaction_manager();
                tm.begin().unwrap();
                match cache.put(sibling, "k", json!(2)) {
                    Ok(_) => {
                        tm.commit().unwrap();
                        true
                    }
                    Err(e) => {
                        assert!(e.is_lock_timeout(), "{}", e);
                        tm.rollback().unwrap();
                        false
                    }
                }
            })
            .join()
            .unwrap()
        })
    }

    #[test]
    fn test_lock_parent_serializes_sibling_changes() {
        for scheme in SCHEMES {
            for lock_parent in [false, true] {
                let cache = started(CacheConfig {
                    lock_parent_for_child_insert_remove: lock_parent,
                    ..config(scheme)
                });
                let tm = cache.transaction_manager();
                cache.put(&fqn("/a/x"), "k", json!(0)).unwrap();

                tm.begin().unwrap();
                cache.put(&fqn("/a/b"), "k", json!(1)).unwrap();
                assert_eq!(
                    sibling_insert_succeeds(&cache, &fqn("/a/c")),
                    !lock_parent,
                    "{:?} insert, lock_parent = {}",
                    scheme,
                    lock_parent
                );
                tm.commit().unwrap();

                tm.begin().unwrap();
                assert!(cache.remove_node(&fqn("/a/x")).unwrap());
                assert_eq!(
                    sibling_insert_succeeds(&cache, &fqn("/a/d")),
                    !lock_parent,
                    "{:?} remove, lock_parent = {}",
                    scheme,
                    lock_parent
                );
                tm.commit().unwrap();

                assert!(sibling_insert_succeeds(&cache, &fqn("/a/e")));
                assert_eq!(cache.number_of_locks_held(), 0);
                assert!(cache.exists(&fqn("/a/b")).unwrap());
                assert!(!cache.exists(&fqn("/a/x")).unwrap());
            }
        }
    }

    #[test]
    fn test_concurrent_writers_on_one_node() {
        for scheme in SCHEMES {
            let cache = started(CacheConfig {
                lock_acquisition_timeout: Duration::from_secs(5),
                ..config(scheme)
            });
            let counter = fqn("/counter");
            cache.put(&counter, "hits", json!(0)).unwrap();

            thread::scope(|s| {
                for worker in 0..4 {
                    let cache = &cache;
                    s.spawn(move || {
                        for i in 0..50 {
                            cache
                                .put(&fqn(&format!("/workers/{}", worker)), "i", json!(i))
                                .unwrap();
                        }
                    });
                }
            });

            assert_eq!(cache.get_children_names(&fqn("/workers")).unwrap().unwrap().len(), 4);
            assert_eq!(cache.number_of_locks_held(), 0);
        }
    }
}

// =============================================================================
// Cache Loader
// =============================================================================

mod loader_tests {
    use super::*;
    use treecache::adapters::InMemoryCacheLoader;
    use treecache::config::LoaderConfig;
    use treecache::domain::ports::CacheLoader;

    fn with_loader(scheme: NodeLockingScheme, loader: &Arc<InMemoryCacheLoader>, passivation: bool) -> TreeCache {
        let cache = CacheBuilder::new(CacheConfig {
            loader: Some(LoaderConfig {
                passivation,
                ..LoaderConfig::default()
            }),
            ..config(scheme)
        })
        .with_loader(loader.clone())
        .build()
        .unwrap();
        cache.start().unwrap();
        cache
    }

    #[test]
    fn test_write_through_and_read_through() {
        for scheme in SCHEMES {
            let loader = Arc::new(InMemoryCacheLoader::new());
            let cache = with_loader(scheme, &loader, false);

            cache.put(&fqn("/a/b"), "k", json!(1)).unwrap();
            assert_eq!(loader.get(&fqn("/a/b")).unwrap(), Some(data(&[("k", json!(1))])));

            // A fresh cache over the same store reads through
            let other = with_loader(scheme, &loader, false);
            assert_eq!(other.get(&fqn("/a/b"), "k").unwrap(), Some(json!(1)));
            assert_eq!(other.get_children_names(&fqn("/a")).unwrap().unwrap().len(), 1);

            cache.remove_node(&fqn("/a")).unwrap();
            assert!(!loader.exists(&fqn("/a/b")).unwrap());
        }
    }

    #[test]
    fn test_transactional_store_waits_for_commit() {
        for scheme in SCHEMES {
            let loader = Arc::new(InMemoryCacheLoader::new());
            let cache = with_loader(scheme, &loader, false);
            let tm = cache.transaction_manager();

            tm.begin().unwrap();
            cache.put(&fqn("/tx"), "k", json!(1)).unwrap();
            assert!(!loader.exists(&fqn("/tx")).unwrap());
            tm.commit().unwrap();
            assert!(loader.exists(&fqn("/tx")).unwrap());

            tm.begin().unwrap();
            cache.put(&fqn("/rolled-back"), "k", json!(1)).unwrap();
            tm.rollback().unwrap();
            assert!(!loader.exists(&fqn("/rolled-back")).unwrap());
            assert_eq!(loader.staged_transactions(), 0);
        }
    }

    #[test]
    fn test_passivation_and_activation() {
        for scheme in SCHEMES {
            let loader = Arc::new(InMemoryCacheLoader::new());
            let cache = with_loader(scheme, &loader, true);
            let a = fqn("/a");

            cache.put(&a, "k", json!(1)).unwrap();
            assert!(!loader.exists(&a).unwrap(), "passivation does not write through");

            assert!(cache.evict(&a, false).unwrap());
            assert_eq!(loader.get(&a).unwrap(), Some(data(&[("k", json!(1))])));
            assert_eq!(cache.number_of_nodes(), 1, "only the root remains");

            assert_eq!(cache.get(&a, "k").unwrap(), Some(json!(1)));
            assert!(!loader.exists(&a).unwrap(), "activation drops the stored copy");
        }
    }

    #[test]
    fn test_skip_cache_loading() {
        let loader = Arc::new(InMemoryCacheLoader::new());
        loader.put(&fqn("/stored"), &data(&[("k", json!(1))])).unwrap();
        let cache = with_loader(NodeLockingScheme::Mvcc, &loader, false);

        let local_only = cache.with_options(treecache::Options::default().skip_cache_loading());
        assert_eq!(local_only.get(&fqn("/stored"), "k").unwrap(), None);
        assert_eq!(cache.get(&fqn("/stored"), "k").unwrap(), Some(json!(1)));
    }
}

// =============================================================================
// Replication & Invalidation
// =============================================================================

mod replication_tests {
    use super::*;
    use assert_matches::assert_matches;
    use treecache::adapters::InMemoryCluster;
    use treecache::{CacheMode, Error};

    fn pair(mode: CacheMode, scheme: NodeLockingScheme) -> (InMemoryCluster, TreeCache, TreeCache) {
        let cluster = InMemoryCluster::new();
        let build = || {
            let cache = CacheBuilder::new(CacheConfig {
                cache_mode: mode,
                ..config(scheme)
            })
            .with_transport(cluster.join())
            .build()
            .unwrap();
            cache.start().unwrap();
            cache
        };
        let (a, b) = (build(), build());
        (cluster, a, b)
    }

    #[test]
    fn test_sync_replication() {
        for scheme in SCHEMES {
            let (_cluster, a, b) = pair(CacheMode::ReplSync, scheme);
            let x = fqn("/x/y");

            a.put(&x, "k", json!(1)).unwrap();
            assert_eq!(b.get(&x, "k").unwrap(), Some(json!(1)));

            b.remove(&x, "k").unwrap();
            assert_eq!(a.get(&x, "k").unwrap(), None);

            a.remove_node(&fqn("/x")).unwrap();
            assert!(!b.exists(&x).unwrap());
        }
    }

    #[test]
    fn test_sync_transaction_replicates_on_commit_only() {
        for scheme in SCHEMES {
            let (_cluster, a, b) = pair(CacheMode::ReplSync, scheme);
            let tm = a.transaction_manager();

            tm.begin().unwrap();
            a.put(&fqn("/tx"), "k", json!(1)).unwrap();
            assert!(!b.exists(&fqn("/tx")).unwrap());
            tm.commit().unwrap();
            assert_eq!(b.get(&fqn("/tx"), "k").unwrap(), Some(json!(1)));

            tm.begin().unwrap();
            a.put(&fqn("/rolled-back"), "k", json!(1)).unwrap();
            tm.rollback().unwrap();
            assert!(!b.exists(&fqn("/rolled-back")).unwrap());

            assert_eq!(b.number_of_locks_held(), 0);
            assert_eq!(b.transaction_count(), 0);
        }
    }

    #[test]
    fn test_async_replication() {
        let (cluster, a, b) = pair(CacheMode::ReplAsync, NodeLockingScheme::Mvcc);
        for i in 0..10 {
            a.put(&fqn(&format!("/n/{}", i)), "k", json!(i)).unwrap();
        }
        assert!(cluster.await_quiescence(Duration::from_secs(5)));
        assert_eq!(b.get_children_names(&fqn("/n")).unwrap().unwrap().len(), 10);
    }

    #[test]
    fn test_replication_queue_flushes_on_stop() {
        let cluster = InMemoryCluster::new();
        let build = || {
            let cache = CacheBuilder::new(CacheConfig {
                cache_mode: CacheMode::ReplAsync,
                use_repl_queue: true,
                repl_queue_interval: Duration::from_secs(3600),
                repl_queue_max_elements: 1000,
                ..config(NodeLockingScheme::Mvcc)
            })
            .with_transport(cluster.join())
            .build()
            .unwrap();
            cache.start().unwrap();
            cache
        };
        let (a, b) = (build(), build());

        a.put(&fqn("/queued"), "k", json!(1)).unwrap();
        assert!(cluster.await_quiescence(Duration::from_secs(1)));

        a.stop().unwrap();
        assert!(cluster.await_quiescence(Duration::from_secs(5)));
        assert_eq!(b.get(&fqn("/queued"), "k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_local_option_skips_replication() {
        let (_cluster, a, b) = pair(CacheMode::ReplSync, NodeLockingScheme::Mvcc);
        a.with_options(treecache::Options::default().cache_mode_local())
            .put(&fqn("/local"), "k", json!(1))
            .unwrap();
        assert!(!b.exists(&fqn("/local")).unwrap());
    }

    #[test]
    fn test_partition_fails_sync_write() {
        let (cluster, a, _b) = pair(CacheMode::ReplSync, NodeLockingScheme::Pessimistic);
        cluster.set_partitioned(true);
        assert_matches!(a.put(&fqn("/p"), "k", json!(1)), Err(Error::Replication(_)));
        assert_eq!(a.number_of_locks_held(), 0);
    }

    #[test]
    fn test_invalidation() {
        for scheme in SCHEMES {
            let (_cluster, a, b) = pair(CacheMode::InvalidationSync, scheme);
            let x = fqn("/x");

            b.with_options(treecache::Options::default().cache_mode_local())
                .put(&x, "k", json!("stale"))
                .unwrap();
            a.put(&x, "k", json!("fresh")).unwrap();

            assert!(!b.exists(&x).unwrap());
            assert_eq!(a.get(&x, "k").unwrap(), Some(json!("fresh")));
        }
    }
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction_tests {
    use super::*;
    use treecache::config::EvictionConfig;

    fn bounded(max_nodes: usize, wake_up_interval: Duration) -> TreeCache {
        started(CacheConfig {
            eviction: Some(EvictionConfig {
                max_nodes,
                wake_up_interval,
                event_queue_size: 1000,
            }),
            ..config(NodeLockingScheme::Mvcc)
        })
    }

    #[test]
    fn test_manual_eviction_round() {
        let cache = bounded(2, Duration::from_secs(3600));
        for name in ["/a", "/b", "/c"] {
            cache.put(&fqn(name), "k", json!(name)).unwrap();
        }
        cache.set_resident(&fqn("/c"), true).unwrap();

        assert_eq!(cache.process_eviction(), 1);
        assert!(!cache.exists(&fqn("/a")).unwrap());
        assert!(cache.exists(&fqn("/b")).unwrap());
        assert!(cache.exists(&fqn("/c")).unwrap());
    }

    #[test]
    fn test_background_eviction() {
        let cache = bounded(5, Duration::from_millis(20));
        for i in 0..20 {
            cache.put(&fqn(&format!("/n{}", i)), "k", json!(i)).unwrap();
        }

        let top_level = || cache.get_children_names(&Fqn::root()).unwrap().unwrap_or_default().len();
        let mut nodes = top_level();
        for _ in 0..100 {
            if nodes <= 5 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
            nodes = top_level();
        }
        assert!(nodes <= 5, "{} nodes left", nodes);
        assert!(cache.exists(&fqn("/n19")).unwrap());
        cache.stop().unwrap();
    }
}

// =============================================================================
// Notifications
// =============================================================================

mod notification_tests {
    use super::*;
    use assert_matches::assert_matches;
    use treecache::adapters::EventCollector;
    use treecache::{CacheEvent, Error, EventKind};

    #[test]
    fn test_event_sequence_for_put() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            let collector = Arc::new(EventCollector::new());
            cache
                .notifier()
                .add_listener(&[EventKind::NodeCreated, EventKind::NodeModified], collector.clone());

            cache.put(&fqn("/a"), "k", json!(1)).unwrap();
            assert_eq!(
                collector.kinds(),
                vec![
                    (EventKind::NodeCreated, true),
                    (EventKind::NodeModified, true),
                    (EventKind::NodeCreated, false),
                    (EventKind::NodeModified, false),
                ]
            );

            collector.clear();
            cache.put(&fqn("/a"), "k", json!(2)).unwrap();
            assert_eq!(
                collector.kinds(),
                vec![(EventKind::NodeModified, true), (EventKind::NodeModified, false)]
            );
        }
    }

    #[test]
    fn test_pre_event_veto() {
        for scheme in SCHEMES {
            let cache = started(config(scheme));
            cache.put(&fqn("/guarded"), "k", json!(1)).unwrap();
            cache.notifier().add_listener(
                &[EventKind::NodeModified],
                Arc::new(|event: &CacheEvent| -> anyhow::Result<()> {
                    if event.is_pre() && event.fqn() == Some(&Fqn::from_string("/guarded")) {
                        anyhow::bail!("read-only node");
                    }
                    Ok(())
                }),
            );

            assert_matches!(cache.put(&fqn("/guarded"), "k", json!(2)), Err(Error::Vetoed { .. }));
            assert_eq!(cache.get(&fqn("/guarded"), "k").unwrap(), Some(json!(1)));
            assert_eq!(cache.number_of_locks_held(), 0);

            // A veto inside a transaction dooms it
            let tm = cache.transaction_manager();
            tm.begin().unwrap();
            assert!(cache.put(&fqn("/guarded"), "k", json!(3)).is_err());
            assert!(tm.current().unwrap().is_rollback_only());
            tm.rollback().unwrap();
        }
    }

    #[test]
    fn test_transaction_and_lifecycle_events() {
        let cache = CacheBuilder::new(config(NodeLockingScheme::Mvcc)).build().unwrap();
        let collector = Arc::new(EventCollector::new());
        cache.notifier().add_listener(
            &[
                EventKind::CacheStarted,
                EventKind::CacheStopped,
                EventKind::TransactionRegistered,
                EventKind::TransactionCompleted,
            ],
            collector.clone(),
        );

        cache.start().unwrap();
        let tm = cache.transaction_manager();
        tm.begin().unwrap();
        cache.put(&fqn("/a"), "k", json!(1)).unwrap();
        cache.put(&fqn("/b"), "k", json!(1)).unwrap();
        tm.commit().unwrap();
        cache.stop().unwrap();

        let kinds: Vec<EventKind> = collector.events().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::CacheStarted,
                EventKind::TransactionRegistered,
                EventKind::TransactionCompleted,
                EventKind::CacheStopped,
            ]
        );
    }

    #[test]
    fn test_listener_may_read_the_cache() {
        let cache = started(config(NodeLockingScheme::Pessimistic));
        let reader = cache.clone();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.notifier().add_listener(
            &[EventKind::NodeModified],
            Arc::new(move |event: &CacheEvent| -> anyhow::Result<()> {
                if !event.is_pre() {
                    if let Some(fqn) = event.fqn() {
                        sink.lock().push(reader.get(fqn, "k")?);
                    }
                }
                Ok(())
            }),
        );

        let tm = cache.transaction_manager();
        tm.begin().unwrap();
        cache.put(&fqn("/a"), "k", json!(1)).unwrap();
        tm.commit().unwrap();
        assert_eq!(*seen.lock(), vec![Some(json!(1))]);
    }
}
