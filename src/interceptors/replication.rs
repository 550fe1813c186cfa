//! Replication Interceptor
//!
//! Sends successful local changes to the other members.
//!
//! - non-transactional writes: broadcast after the local change
//! - synchronous transactions: two-phase; the modifications are broadcast
//!   as a `Prepare` during the local prepare, followed by `Commit` or
//!   `Rollback`
//! - asynchronous transactions: a one-phase `Prepare` after local commit
//!
//! Asynchronous traffic may be batched through a [`ReplicationQueue`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult, ReplicableCommand};
use crate::context::InvocationContext;
use crate::domain::ports::{DeliveryMode, Transport};
use crate::error::Result;

// =============================================================================
// Replication Queue
// =============================================================================

/// Batches asynchronous commands into one `Batch` per flush
pub struct ReplicationQueue {
    transport: Arc<dyn Transport>,
    pending: Mutex<Vec<ReplicableCommand>>,
    max_elements: usize,
    timeout: Duration,
}

impl ReplicationQueue {
    pub fn new(transport: Arc<dyn Transport>, max_elements: usize, timeout: Duration) -> Self {
        Self {
            transport,
            pending: Mutex::new(Vec::new()),
            max_elements: max_elements.max(1),
            timeout,
        }
    }

    /// Queue `command`; flushes when the queue is full
    pub fn add(&self, command: ReplicableCommand) {
        let full = {
            let mut pending = self.pending.lock();
            pending.push(command);
            pending.len() >= self.max_elements
        };
        if full {
            self.flush();
        }
    }

    /// Send everything queued; returns the number of commands sent
    pub fn flush(&self) -> usize {
        let commands = std::mem::take(&mut *self.pending.lock());
        if commands.is_empty() {
            return 0;
        }
        let count = commands.len();
        match self
            .transport
            .broadcast(&ReplicableCommand::Batch { commands }, DeliveryMode::Async, self.timeout)
        {
            Ok(()) => debug!(count, "replication queue flushed"),
            Err(e) => error!(count, error = %e, "replication queue flush failed"),
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Periodic flush until `token` is cancelled; flushes once more on exit
    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        info!(?interval, "replication queue started");
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.flush();
                    info!("replication queue stopped");
                    break;
                }
                _ = tick.tick() => {
                    self.flush();
                }
            }
        }
    }
}

// =============================================================================
// Interceptor
// =============================================================================

pub struct ReplicationInterceptor {
    transport: Arc<dyn Transport>,
    mode: DeliveryMode,
    timeout: Duration,
    queue: Option<Arc<ReplicationQueue>>,
}

impl ReplicationInterceptor {
    pub fn new(
        transport: Arc<dyn Transport>,
        mode: DeliveryMode,
        timeout: Duration,
        queue: Option<Arc<ReplicationQueue>>,
    ) -> Self {
        Self {
            transport,
            mode,
            timeout,
            queue,
        }
    }

    fn broadcast(&self, command: ReplicableCommand, mode: DeliveryMode) -> Result<()> {
        if mode == DeliveryMode::Async {
            if let Some(queue) = &self.queue {
                queue.add(command);
                return Ok(());
            }
        }
        self.transport.broadcast(&command, mode, self.timeout)
    }

    /// Modifications to send and whether a two-phase prepare went out
    fn tx_state(ctx: &InvocationContext) -> (Vec<ReplicableCommand>, bool) {
        ctx.tx_context()
            .map(|context| {
                let context = context.lock();
                (context.replicable.clone(), context.prepare_replicated)
            })
            .unwrap_or_default()
    }
}

impl Interceptor for ReplicationInterceptor {
    fn name(&self) -> &str {
        "ReplicationInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        if !ctx.is_origin_local() {
            return next.invoke(ctx, command);
        }

        match command {
            Command::Prepare { gtx, .. } => {
                let result = next.invoke(ctx, command)?;
                if self.mode == DeliveryMode::Sync {
                    let (modifications, _) = Self::tx_state(ctx);
                    if let (false, Some(context)) = (modifications.is_empty(), ctx.tx_context()) {
                        context.lock().prepare_replicated = true;
                        debug!(gtx = %gtx, count = modifications.len(), "replicating prepare");
                        self.broadcast(
                            ReplicableCommand::Prepare {
                                gtx: gtx.clone(),
                                modifications,
                                one_phase: false,
                            },
                            DeliveryMode::Sync,
                        )?;
                    }
                }
                Ok(result)
            }
            Command::Commit { gtx } => {
                let result = next.invoke(ctx, command)?;
                let (modifications, prepared) = Self::tx_state(ctx);
                let outcome = if prepared {
                    self.broadcast(ReplicableCommand::Commit { gtx: gtx.clone() }, DeliveryMode::Sync)
                } else if !modifications.is_empty() && self.mode == DeliveryMode::Async {
                    self.broadcast(
                        ReplicableCommand::Prepare {
                            gtx: gtx.clone(),
                            modifications,
                            one_phase: true,
                        },
                        DeliveryMode::Async,
                    )
                } else {
                    Ok(())
                };
                if let Err(e) = outcome {
                    warn!(gtx = %gtx, error = %e, "commit replication failed after local commit");
                }
                Ok(result)
            }
            Command::Rollback { gtx } => {
                let result = next.invoke(ctx, command);
                let (_, prepared) = Self::tx_state(ctx);
                if prepared {
                    if let Err(e) = self.broadcast(ReplicableCommand::Rollback { gtx: gtx.clone() }, DeliveryMode::Sync) {
                        warn!(gtx = %gtx, error = %e, "rollback replication failed");
                    }
                }
                result
            }
            _ if command.is_write() && !ctx.is_in_transaction() => {
                let result = next.invoke(ctx, command)?;
                if !ctx.options().cache_mode_local {
                    if let Some(replicable) = command.to_replicable() {
                        let mode = match command {
                            Command::PutForExternalRead { .. } => DeliveryMode::Async,
                            _ => self.mode,
                        };
                        self.broadcast(replicable, mode)?;
                    }
                }
                Ok(result)
            }
            _ => next.invoke(ctx, command),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::RemoteCommandHandler;
    use crate::fqn::Fqn;
    use crate::transaction::Address;
    use std::sync::Weak;

    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<(ReplicableCommand, DeliveryMode)>>,
    }

    impl Transport for CapturingTransport {
        fn start(&self, _handler: Weak<dyn RemoteCommandHandler>) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {}

        fn local_address(&self) -> Address {
            Address::random()
        }

        fn members(&self) -> Vec<Address> {
            Vec::new()
        }

        fn broadcast(&self, command: &ReplicableCommand, mode: DeliveryMode, _timeout: Duration) -> Result<()> {
            self.sent.lock().push((command.clone(), mode));
            Ok(())
        }
    }

    fn remove(path: &str) -> ReplicableCommand {
        ReplicableCommand::RemoveNode {
            fqn: Fqn::from_string(path),
        }
    }

    #[test]
    fn test_queue_flushes_when_full() {
        let transport = Arc::new(CapturingTransport::default());
        let queue = ReplicationQueue::new(transport.clone(), 2, Duration::from_secs(1));

        queue.add(remove("/a"));
        assert_eq!(queue.len(), 1);
        assert!(transport.sent.lock().is_empty());

        queue.add(remove("/b"));
        assert!(queue.is_empty());
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], (ReplicableCommand::Batch { commands }, DeliveryMode::Async) if commands.len() == 2));
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let transport = Arc::new(CapturingTransport::default());
        let queue = ReplicationQueue::new(transport.clone(), 10, Duration::from_secs(1));
        assert_eq!(queue.flush(), 0);
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_background_flush_on_cancel() {
        let transport = Arc::new(CapturingTransport::default());
        let queue = Arc::new(ReplicationQueue::new(transport.clone(), 100, Duration::from_secs(1)));
        let token = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&queue).run(Duration::from_secs(3600), token.clone()));
        queue.add(remove("/a"));
        token.cancel();
        task.await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(transport.sent.lock().len(), 1);
    }
}
