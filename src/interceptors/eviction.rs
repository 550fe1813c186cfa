//! Eviction Interceptor
//!
//! Reports node activity to the eviction manager's event queue. Events are
//! only queued here; the policy runs on the eviction thread.

use std::sync::Arc;

use crossbeam::channel::{Sender, TrySendError};
use tracing::warn;

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::domain::ports::EvictionEvent;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::tree::DataContainer;

pub struct EvictionInterceptor {
    events: Sender<EvictionEvent>,
    container: Arc<DataContainer>,
}

impl EvictionInterceptor {
    pub fn new(events: Sender<EvictionEvent>, container: Arc<DataContainer>) -> Self {
        Self { events, container }
    }

    fn send(&self, event: EvictionEvent) {
        if event.fqn().is_root() {
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(fqn = %event.fqn(), "eviction event queue full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn written(&self, fqn: &Fqn, existed: bool) {
        let fqn = fqn.clone();
        self.send(if existed {
            EvictionEvent::Visited(fqn)
        } else {
            EvictionEvent::Added(fqn)
        });
    }
}

impl Interceptor for EvictionInterceptor {
    fn name(&self) -> &str {
        "EvictionInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        let existed = command
            .creates_node()
            .then(|| command.fqn().map(|fqn| self.container.exists(fqn)))
            .flatten()
            .unwrap_or(false);

        let result = next.invoke(ctx, command)?;

        match command {
            Command::Put { fqn, .. } | Command::PutKeyValue { fqn, .. } | Command::PutForExternalRead { fqn, .. } => {
                self.written(fqn, existed)
            }
            Command::RemoveKey { fqn, .. } | Command::ClearData { fqn } => {
                self.send(EvictionEvent::Visited(fqn.clone()))
            }
            Command::RemoveNode { fqn } | Command::Evict { fqn, .. } | Command::Invalidate { fqn } => {
                self.send(EvictionEvent::Removed(fqn.clone()))
            }
            Command::Move { from, to_parent } => {
                self.send(EvictionEvent::Removed(from.clone()));
                if let Some(name) = from.last_element() {
                    self.send(EvictionEvent::Added(to_parent.child(name.clone())));
                }
            }
            command if command.is_read() && result.is_hit() => {
                if let Some(fqn) = command.fqn() {
                    self.send(EvictionEvent::Visited(fqn.clone()));
                }
            }
            _ => {}
        }
        Ok(result)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;
    use crate::interceptors::InterceptorChain;
    use crossbeam::channel::bounded;
    use serde_json::json;
    use std::time::Duration;

    fn ctx() -> InvocationContext {
        InvocationContext::new(Options::default(), Duration::from_millis(50))
    }

    #[test]
    fn test_activity_events() {
        let container = Arc::new(DataContainer::new());
        container.start();
        let (tx, rx) = bounded(16);
        let chain = InterceptorChain::new(vec![Arc::new(EvictionInterceptor::new(tx, Arc::clone(&container)))]);
        let fqn = Fqn::from_string("/a");

        let put = Command::PutKeyValue {
            fqn: fqn.clone(),
            key: "k".into(),
            value: json!(1),
        };
        chain.invoke(&mut ctx(), &put).unwrap();
        container.create_nodes(&fqn);
        chain.invoke(&mut ctx(), &put).unwrap();
        chain.invoke(&mut ctx(), &Command::RemoveNode { fqn: fqn.clone() }).unwrap();
        chain
            .invoke(
                &mut ctx(),
                &Command::Move {
                    from: fqn.clone(),
                    to_parent: Fqn::from_string("/b"),
                },
            )
            .unwrap();

        let events: Vec<EvictionEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                EvictionEvent::Added(fqn.clone()),
                EvictionEvent::Visited(fqn.clone()),
                EvictionEvent::Removed(fqn.clone()),
                EvictionEvent::Removed(fqn),
                EvictionEvent::Added(Fqn::from_string("/b/a")),
            ]
        );
    }

    #[test]
    fn test_root_and_full_queue_are_ignored() {
        let container = Arc::new(DataContainer::new());
        let (tx, rx) = bounded(1);
        let interceptor = EvictionInterceptor::new(tx, container);
        interceptor.send(EvictionEvent::Added(Fqn::root()));
        assert!(rx.is_empty());

        interceptor.send(EvictionEvent::Added(Fqn::from_string("/a")));
        interceptor.send(EvictionEvent::Added(Fqn::from_string("/b")));
        assert_eq!(rx.len(), 1);
    }
}
