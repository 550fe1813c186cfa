//! Event Notifier
//!
//! Subscription table from [`EventKind`] to an ordered list of listeners.
//! Delivery is synchronous on the calling thread, in registration order.
//!
//! - pre-phase node events: the first listener error aborts delivery and
//!   becomes [`Error::Vetoed`]
//! - post-phase node events and transaction events: errors are logged and
//!   delivery continues
//! - lifecycle events: the first error becomes [`Error::Lifecycle`]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::domain::events::{CacheEvent, EventKind};
use crate::domain::ports::CacheListener;
use crate::error::{Error, Result};

/// Handle returned by [`Notifier::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Subscribers = Vec<(ListenerId, Arc<dyn CacheListener>)>;

/// Listener registry and dispatcher
pub struct Notifier {
    subscriptions: RwLock<HashMap<EventKind, Subscribers>>,
    next_id: AtomicU64,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `listener` to `kinds`
    pub fn add_listener(&self, kinds: &[EventKind], listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscriptions = self.subscriptions.write();
        for kind in kinds {
            subscriptions
                .entry(*kind)
                .or_default()
                .push((id, Arc::clone(&listener)));
        }
        trace!(listener = id.0, kinds = kinds.len(), "listener registered");
        id
    }

    /// Subscribe `listener` to every event kind
    pub fn add_listener_for_all(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        self.add_listener(&EventKind::ALL, listener)
    }

    /// Unsubscribe; false if `id` was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut removed = false;
        let mut subscriptions = self.subscriptions.write();
        for subscribers in subscriptions.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|(candidate, _)| *candidate != id);
            removed |= subscribers.len() != before;
        }
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.subscriptions.read().contains_key(&kind)
    }

    /// Number of distinct registered listeners
    pub fn listener_count(&self) -> usize {
        let subscriptions = self.subscriptions.read();
        let mut ids: Vec<ListenerId> = subscriptions
            .values()
            .flat_map(|subscribers| subscribers.iter().map(|(id, _)| *id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Deliver `event` to its subscribers
    pub fn notify(&self, event: &CacheEvent) -> Result<()> {
        let kind = event.kind();
        let subscribers = match self.subscriptions.read().get(&kind) {
            Some(subscribers) => subscribers.clone(),
            None => return Ok(()),
        };

        for (id, listener) in subscribers {
            let Err(e) = listener.on_event(event) else { continue };

            if kind.is_lifecycle() {
                warn!(event = %kind, listener = id.0, error = %e, "listener failed during lifecycle transition");
                return Err(Error::Lifecycle(format!("{} listener failed: {}", kind, e)));
            }
            if event.is_pre() {
                warn!(event = %kind, listener = id.0, error = %e, "operation vetoed");
                return Err(Error::Vetoed {
                    kind: kind.to_string(),
                    reason: e.to_string(),
                });
            }
            warn!(event = %kind, listener = id.0, error = %e, "listener failed, ignoring");
        }
        Ok(())
    }

    /// Build and deliver an event only if someone listens for `kind`
    pub fn notify_with(&self, kind: EventKind, build: impl FnOnce() -> CacheEvent) -> Result<()> {
        if !self.has_listeners(kind) {
            return Ok(());
        }
        self.notify(&build())
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
