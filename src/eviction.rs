//! Eviction Manager
//!
//! Drains node activity reported by the eviction interceptor into the
//! configured policy and evicts the victims it selects. Victims are evicted
//! through the cache's own `evict` entry point so locking and notification
//! apply. A victim that cannot be evicted right now (usually because it is
//! locked) is handed back to the policy for the next round.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ports::{EvictionEvent, EvictionPolicy};
use crate::error::Result;
use crate::fqn::Fqn;

pub struct EvictionManager {
    sender: Sender<EvictionEvent>,
    receiver: Receiver<EvictionEvent>,
    policy: Mutex<Box<dyn EvictionPolicy>>,
}

impl EvictionManager {
    pub fn new(policy: Box<dyn EvictionPolicy>, event_queue_size: usize) -> Self {
        let (sender, receiver) = bounded(event_queue_size.max(1));
        Self {
            sender,
            receiver,
            policy: Mutex::new(policy),
        }
    }

    /// Producer side, handed to the eviction interceptor
    pub fn sender(&self) -> Sender<EvictionEvent> {
        self.sender.clone()
    }

    pub fn policy_name(&self) -> String {
        self.policy.lock().name().to_string()
    }

    /// Events waiting to be processed
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Nodes the policy currently tracks
    pub fn tracked(&self) -> usize {
        self.policy.lock().tracked()
    }

    /// One eviction round; returns the number of nodes evicted
    ///
    /// `evict` returns `Ok(false)` when the node no longer exists.
    pub fn process(&self, mut evict: impl FnMut(&Fqn) -> Result<bool>) -> usize {
        let victims = {
            let mut policy = self.policy.lock();
            for event in self.receiver.try_iter() {
                policy.on_event(&event);
            }
            policy.select_victims()
        };
        if victims.is_empty() {
            return 0;
        }

        let mut evicted = 0;
        let mut retry = Vec::new();
        for fqn in victims {
            match evict(&fqn) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(fqn = %fqn, error = %e, "eviction deferred");
                    retry.push(fqn);
                }
            }
        }

        if !retry.is_empty() {
            let mut policy = self.policy.lock();
            for fqn in retry {
                policy.on_event(&EvictionEvent::Added(fqn));
            }
        }
        debug!(evicted, "eviction round complete");
        evicted
    }

    /// Periodic processing until `token` is cancelled
    pub async fn run<F>(self: Arc<Self>, evict: F, interval: Duration, token: CancellationToken)
    where
        F: Fn(&Fqn) -> Result<bool> + Send + 'static,
    {
        info!(policy = %self.policy_name(), ?interval, "eviction timer started");
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("eviction timer stopped");
                    break;
                }
                _ = tick.tick() => {
                    // Eviction takes blocking locks
                    let evicted = tokio::task::block_in_place(|| self.process(&evict));
                    if evicted > 0 {
                        info!(evicted, "evicted nodes");
                    }
                }
            }
        }
        if !self.receiver.is_empty() {
            warn!(queued = self.receiver.len(), "eviction events left unprocessed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
