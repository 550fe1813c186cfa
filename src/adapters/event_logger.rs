//! Event Listener Adapters
//!
//! Implements the `CacheListener` port with logging and in-memory backends.

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::events::{CacheEvent, EventKind};
use crate::domain::ports::CacheListener;

/// Logging-based listener.
///
/// Writes every event it receives to the tracing system. Useful for
/// development, debugging, and audit trails.
#[derive(Debug, Clone, Default)]
pub struct LoggingListener {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
    /// Skip pre-phase node events
    post_only: bool,
}

impl LoggingListener {
    /// Create a new logging listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listener that logs at info level.
    pub fn info_level() -> Self {
        Self {
            info_level: true,
            ..Self::default()
        }
    }

    /// Create a listener that logs at debug level.
    pub fn debug_level() -> Self {
        Self::default()
    }

    /// Only log events after the change happened.
    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }
}

impl CacheListener for LoggingListener {
    fn on_event(&self, event: &CacheEvent) -> anyhow::Result<()> {
        if self.post_only && event.is_pre() {
            return Ok(());
        }
        let event_type = event.event_type();
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type = %event_type, event = %json, "Cache event");
        } else {
            debug!(event_type = %event_type, event = %json, "Cache event");
        }
        Ok(())
    }
}

/// In-memory event collector for testing.
///
/// Collects events in memory for later inspection during tests.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: RwLock<Vec<CacheEvent>>,
}

impl EventCollector {
    /// Create a new in-memory event collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.read().clone()
    }

    /// Get the count of collected events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific kind.
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<CacheEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Kinds and phases in delivery order.
    pub fn kinds(&self) -> Vec<(EventKind, bool)> {
        self.events.read().iter().map(|e| (e.kind(), e.is_pre())).collect()
    }
}

impl CacheListener for EventCollector {
    fn on_event(&self, event: &CacheEvent) -> anyhow::Result<()> {
        self.events.write().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fqn::Fqn;

    #[test]
    fn test_logging_listener() {
        let listener = LoggingListener::info_level().post_only();
        let event = CacheEvent::node_created(Fqn::from_string("/a"), true, true, None);

        // Should not fail
        listener.on_event(&event).unwrap();
    }

    #[test]
    fn test_event_collector() {
        let collector = EventCollector::new();

        assert!(collector.is_empty());

        collector
            .on_event(&CacheEvent::node_created(Fqn::from_string("/a"), true, true, None))
            .unwrap();
        collector
            .on_event(&CacheEvent::node_removed(Fqn::from_string("/a"), false, true, None))
            .unwrap();

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.events_of_kind(EventKind::NodeCreated).len(), 1);
        assert_eq!(
            collector.kinds(),
            vec![(EventKind::NodeCreated, true), (EventKind::NodeRemoved, false)]
        );

        collector.clear();
        assert!(collector.is_empty());
    }
}
