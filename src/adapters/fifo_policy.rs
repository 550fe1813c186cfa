//! First-In-First-Out Eviction Policy
//!
//! Keeps at most `max_nodes` nodes (0 means unbounded); the oldest
//! additions go first. Visits do not change a node's position.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::domain::ports::{EvictionEvent, EvictionPolicy};
use crate::fqn::Fqn;

#[derive(Debug)]
pub struct FifoEvictionPolicy {
    max_nodes: usize,
    sequence: u64,
    order: BTreeMap<u64, Fqn>,
    positions: HashMap<Fqn, u64>,
}

impl FifoEvictionPolicy {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            sequence: 0,
            order: BTreeMap::new(),
            positions: HashMap::new(),
        }
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    fn forget_subtree(&mut self, fqn: &Fqn) {
        let order = &mut self.order;
        self.positions.retain(|tracked, position| {
            let keep = !tracked.is_child_or_equals(fqn);
            if !keep {
                order.remove(position);
            }
            keep
        });
    }
}

impl EvictionPolicy for FifoEvictionPolicy {
    fn name(&self) -> &str {
        "fifo"
    }

    fn on_event(&mut self, event: &EvictionEvent) {
        match event {
            EvictionEvent::Added(fqn) => {
                if !self.positions.contains_key(fqn) {
                    self.sequence += 1;
                    self.order.insert(self.sequence, fqn.clone());
                    self.positions.insert(fqn.clone(), self.sequence);
                }
            }
            EvictionEvent::Visited(_) => {}
            EvictionEvent::Removed(fqn) => self.forget_subtree(fqn),
        }
    }

    fn select_victims(&mut self) -> Vec<Fqn> {
        if self.max_nodes == 0 {
            return Vec::new();
        }
        let excess = self.positions.len().saturating_sub(self.max_nodes);
        let mut victims = Vec::with_capacity(excess);
        for _ in 0..excess {
            let Some((_, fqn)) = self.order.pop_first() else { break };
            self.positions.remove(&fqn);
            victims.push(fqn);
        }
        if !victims.is_empty() {
            trace!(count = victims.len(), tracked = self.positions.len(), "selected fifo victims");
        }
        victims
    }

    fn tracked(&self) -> usize {
        self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fqn(s: &str) -> Fqn {
        Fqn::from_string(s)
    }

    #[test]
    fn test_oldest_nodes_are_selected() {
        let mut policy = FifoEvictionPolicy::new(2);
        for path in ["/a", "/b", "/c", "/d"] {
            policy.on_event(&EvictionEvent::Added(fqn(path)));
        }
        // Visits and duplicate additions keep the original order
        policy.on_event(&EvictionEvent::Visited(fqn("/a")));
        policy.on_event(&EvictionEvent::Added(fqn("/a")));

        assert_eq!(policy.select_victims(), vec![fqn("/a"), fqn("/b")]);
        assert_eq!(policy.tracked(), 2);
        assert!(policy.select_victims().is_empty());
    }

    #[test]
    fn test_removal_forgets_subtree() {
        let mut policy = FifoEvictionPolicy::new(1);
        policy.on_event(&EvictionEvent::Added(fqn("/a")));
        policy.on_event(&EvictionEvent::Added(fqn("/a/b")));
        policy.on_event(&EvictionEvent::Added(fqn("/ab")));
        policy.on_event(&EvictionEvent::Added(fqn("/c")));
        policy.on_event(&EvictionEvent::Removed(fqn("/a")));

        assert_eq!(policy.tracked(), 2);
        assert_eq!(policy.select_victims(), vec![fqn("/ab")]);
    }

    #[test]
    fn test_zero_bound_is_unbounded() {
        let mut policy = FifoEvictionPolicy::new(0);
        policy.on_event(&EvictionEvent::Added(fqn("/a")));
        assert!(policy.select_victims().is_empty());
        assert_eq!(policy.tracked(), 1);
    }
}
