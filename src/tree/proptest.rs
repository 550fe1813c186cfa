//! Property-Based Tests for the Node Tree
//!
//! Uses proptest to check the tree against arbitrary operation sequences.
//!
//! # Test Properties
//!
//! 1. **Subtree Contiguity**: an Fqn's descendants form one contiguous
//!    range of any ordered set of Fqns
//! 2. **View Equivalence**: in-place, transactional and MVCC views commit
//!    the same tree for the same operations
//! 3. **Rollback**: undoing a pessimistic transaction restores the tree
//! 4. **Concurrent Inserts**: distinct children inserted from many threads
//!    are all present afterwards, under both locking schemes

#![cfg(test)]

use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use super::view::{purge_tombstones, undo_transaction};
use super::{DataContainer, DataView, DirectView, NodeData, Workspace, WorkspaceView};
use crate::config::{CacheConfig, NodeLockingScheme};
use crate::fqn::Fqn;
use crate::transaction::{Address, GlobalTransaction, TransactionContext};
use crate::CacheBuilder;

// =============================================================================
// Property Strategies
// =============================================================================

/// Non-root paths over a small alphabet so operations collide often
fn fqn_strategy() -> impl Strategy<Value = Fqn> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 1..=3).prop_map(Fqn::from_elements)
}

#[derive(Debug, Clone)]
enum Op {
    Put(Fqn, String, i64),
    PutAll(Fqn, i64, bool),
    RemoveKey(Fqn, String),
    ClearData(Fqn),
    RemoveNode(Fqn),
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["k1", "k2"]).prop_map(String::from)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (fqn_strategy(), key_strategy(), 0i64..100).prop_map(|(f, k, v)| Op::Put(f, k, v)),
        1 => (fqn_strategy(), 0i64..100, any::<bool>()).prop_map(|(f, v, erase)| Op::PutAll(f, v, erase)),
        1 => (fqn_strategy(), key_strategy()).prop_map(|(f, k)| Op::RemoveKey(f, k)),
        1 => fqn_strategy().prop_map(Op::ClearData),
        2 => fqn_strategy().prop_map(Op::RemoveNode),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..25)
}

// =============================================================================
// Helpers
// =============================================================================

fn container() -> DataContainer {
    let container = DataContainer::new();
    container.start();
    container
}

fn tx() -> TransactionContext {
    TransactionContext::new(GlobalTransaction::new(Address::random(), 1), false)
}

fn apply(view: &mut dyn DataView, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Put(fqn, key, value) => {
                view.put_key(fqn, key, json!(value));
            }
            Op::PutAll(fqn, value, erase) => {
                let data: NodeData = [("all".to_string(), json!(value))].into_iter().collect();
                view.put(fqn, data, *erase);
            }
            Op::RemoveKey(fqn, key) => {
                view.remove_key(fqn, key);
            }
            Op::ClearData(fqn) => {
                view.clear_data(fqn);
            }
            Op::RemoveNode(fqn) => {
                view.remove_node(fqn);
            }
        }
    }
}

/// Every live node with its data
fn dump(container: &DataContainer) -> BTreeMap<Fqn, NodeData> {
    container
        .all_nodes()
        .into_iter()
        .filter(|node| node.is_valid() && !node.is_deleted())
        .map(|node| (node.fqn().clone(), node.read().data().clone()))
        .collect()
}

fn seeded(seed: &[Op]) -> DataContainer {
    let container = container();
    apply(&mut DirectView::new(&container, None), seed);
    container
}

// =============================================================================
// Fqn Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: A node sorts before all of its descendants.
    #[test]
    fn prop_parent_sorts_first(fqn in fqn_strategy(), suffix in fqn_strategy()) {
        let descendant = Fqn::from_relative(&fqn, &suffix);
        prop_assert!(fqn < descendant);
        prop_assert!(descendant.is_child_of(&fqn));
        prop_assert!(Fqn::root() < fqn);
    }

    /// Property: Descendants of any Fqn are one contiguous range.
    #[test]
    fn prop_subtree_is_contiguous(
        set in prop::collection::btree_set(fqn_strategy(), 0..30),
        prefix in fqn_strategy(),
    ) {
        let ranged: Vec<&Fqn> = set
            .range(prefix.clone()..)
            .take_while(|candidate| candidate.is_child_or_equals(&prefix))
            .collect();
        let filtered: Vec<&Fqn> = set.iter().filter(|candidate| candidate.is_child_or_equals(&prefix)).collect();
        prop_assert_eq!(ranged, filtered);
    }

    /// Property: Re-rooting keeps the relative path.
    #[test]
    fn prop_replace_ancestor(
        base in fqn_strategy(),
        suffix in fqn_strategy(),
        target in fqn_strategy(),
    ) {
        let fqn = Fqn::from_relative(&base, &suffix);
        let moved = fqn.replace_ancestor(&base, &target);
        prop_assert!(moved.is_child_of(&target));
        prop_assert_eq!(moved.size(), target.size() + suffix.size());
        prop_assert_eq!(moved.replace_ancestor(&target, &base), fqn);
    }

    /// Property: The string form parses back to the same Fqn.
    #[test]
    fn prop_string_form_parses_back(fqn in fqn_strategy()) {
        prop_assert_eq!(Fqn::from_string(&fqn.to_string()), fqn);
    }
}

// =============================================================================
// View Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: Transactional and MVCC views commit the same tree as
    /// applying the operations directly.
    #[test]
    fn prop_views_commit_the_same_tree(seed in ops_strategy(), ops in ops_strategy()) {
        let direct = seeded(&seed);
        apply(&mut DirectView::new(&direct, None), &ops);
        let expected = dump(&direct);

        let pessimistic = seeded(&seed);
        let mut context = tx();
        apply(&mut DirectView::new(&pessimistic, Some(&mut context)), &ops);
        for removed in std::mem::take(&mut context.removed) {
            purge_tombstones(&pessimistic, &removed);
        }
        prop_assert_eq!(dump(&pessimistic), expected.clone());

        let mvcc = seeded(&seed);
        let mut workspace = Workspace::new();
        apply(&mut WorkspaceView::new(&mvcc, &mut workspace, false), &ops);
        workspace.apply(&mvcc);
        prop_assert_eq!(dump(&mvcc), expected);
    }

    /// Property: Undoing a pessimistic transaction restores the prior tree.
    #[test]
    fn prop_undo_restores_tree(seed in ops_strategy(), ops in ops_strategy()) {
        let container = seeded(&seed);
        let before = dump(&container);

        let mut context = tx();
        apply(&mut DirectView::new(&container, Some(&mut context)), &ops);
        undo_transaction(&container, &mut context);

        prop_assert_eq!(dump(&container), before);
    }

    /// Property: A discarded workspace leaves the committed tree untouched.
    #[test]
    fn prop_discarded_workspace_is_invisible(seed in ops_strategy(), ops in ops_strategy()) {
        let container = seeded(&seed);
        let before = dump(&container);

        let mut workspace = Workspace::new();
        apply(&mut WorkspaceView::new(&container, &mut workspace, false), &ops);
        drop(workspace);

        prop_assert_eq!(dump(&container), before);
    }
}

// =============================================================================
// Concurrency Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Property: Inserting distinct children of one parent from several
    /// threads leaves every child present and no lock held.
    #[test]
    fn prop_concurrent_distinct_children(
        threads in 2usize..=6,
        per_thread in 1usize..=10,
        pessimistic in any::<bool>(),
    ) {
        let scheme = if pessimistic { NodeLockingScheme::Pessimistic } else { NodeLockingScheme::Mvcc };
        let cache = CacheBuilder::new(CacheConfig {
            node_locking_scheme: scheme,
            lock_acquisition_timeout: Duration::from_secs(10),
            ..CacheConfig::default()
        })
        .build()?;
        cache.start()?;
        let parent = Fqn::from_string("/parent");

        thread::scope(|s| {
            for worker in 0..threads {
                let cache = &cache;
                let parent = &parent;
                s.spawn(move || {
                    for i in 0..per_thread {
                        let child = parent.child(format!("{}-{}", worker, i));
                        cache.put(&child, "worker", json!(worker)).expect("insert failed");
                    }
                });
            }
        });

        let children = cache.get_children_names(&parent)?.unwrap_or_default();
        prop_assert_eq!(children.len(), threads * per_thread);
        let expected: BTreeSet<String> = (0..threads)
            .flat_map(|worker| (0..per_thread).map(move |i| format!("{}-{}", worker, i)))
            .collect();
        let actual: BTreeSet<String> = children.iter().map(|name| name.to_string()).collect();
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(cache.number_of_locks_held(), 0);
    }
}
