//! In-Process Transport
//!
//! Implements the `Transport` port for caches living in one process. Every
//! command crosses the "wire" as JSON so replicated state never shares
//! memory with its origin. Synchronous broadcasts are applied inline on
//! the caller's thread; asynchronous ones go through a per-member inbox
//! drained by a delivery thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::commands::ReplicableCommand;
use crate::domain::ports::{DeliveryMode, RemoteCommandHandler, Transport};
use crate::error::{Error, Result};
use crate::transaction::Address;

struct Envelope {
    origin: Address,
    payload: Vec<u8>,
}

struct Member {
    handler: Weak<dyn RemoteCommandHandler>,
    inbox: Sender<Envelope>,
}

#[derive(Default)]
struct ClusterState {
    members: RwLock<BTreeMap<Address, Member>>,
    pending: Mutex<usize>,
    drained: Condvar,
    partitioned: AtomicBool,
    delivered: AtomicU64,
}

impl ClusterState {
    fn decode(payload: &[u8]) -> Result<ReplicableCommand> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn deliver(&self, handler: &Weak<dyn RemoteCommandHandler>, envelope: Envelope) -> Result<()> {
        let Some(handler) = handler.upgrade() else {
            debug!(origin = %envelope.origin, "receiver gone, message dropped");
            return Ok(());
        };
        let command = Self::decode(&envelope.payload)?;
        handler.handle_remote(envelope.origin, command)?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn enqueued(&self) {
        *self.pending.lock() += 1;
    }

    fn completed(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

/// Group of in-process members
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a new member; it joins the group on `start`
    pub fn join(&self) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            cluster: Arc::clone(&self.state),
            address: Address::random(),
            worker: Mutex::new(None),
        })
    }

    /// Fail every broadcast until healed
    pub fn set_partitioned(&self, partitioned: bool) {
        self.state.partitioned.store(partitioned, Ordering::Release);
    }

    pub fn member_count(&self) -> usize {
        self.state.members.read().len()
    }

    /// Commands applied by receivers so far
    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    /// Wait until no asynchronous message is in flight
    pub fn await_quiescence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            if self.state.drained.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }
}

/// One member's view of an [`InMemoryCluster`]
pub struct InMemoryTransport {
    cluster: Arc<ClusterState>,
    address: Address,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryTransport {
    fn targets(&self) -> Vec<(Address, Weak<dyn RemoteCommandHandler>, Sender<Envelope>)> {
        self.cluster
            .members
            .read()
            .iter()
            .filter(|(address, _)| **address != self.address)
            .map(|(address, member)| (*address, member.handler.clone(), member.inbox.clone()))
            .collect()
    }
}

impl Transport for InMemoryTransport {
    fn start(&self, handler: Weak<dyn RemoteCommandHandler>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(Error::InvalidState(format!("member {} already started", self.address)));
        }

        let (inbox, receiver) = unbounded::<Envelope>();
        let cluster = Arc::clone(&self.cluster);
        let receiver_handler = handler.clone();
        let address = self.address;
        let handle = std::thread::Builder::new()
            .name(format!("transport-{}", address))
            .spawn(move || {
                for envelope in receiver.iter() {
                    let origin = envelope.origin;
                    if let Err(e) = cluster.deliver(&receiver_handler, envelope) {
                        error!(member = %address, origin = %origin, error = %e, "async delivery failed");
                    }
                    cluster.completed();
                }
                trace!(member = %address, "delivery thread exiting");
            })?;
        *worker = Some(handle);

        self.cluster
            .members
            .write()
            .insert(self.address, Member { handler, inbox });
        debug!(member = %self.address, "joined cluster");
        Ok(())
    }

    fn stop(&self) {
        self.cluster.members.write().remove(&self.address);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(member = %self.address, "delivery thread panicked");
            }
        }
        debug!(member = %self.address, "left cluster");
    }

    fn local_address(&self) -> Address {
        self.address
    }

    fn members(&self) -> Vec<Address> {
        self.cluster.members.read().keys().copied().collect()
    }

    fn broadcast(&self, command: &ReplicableCommand, mode: DeliveryMode, timeout: Duration) -> Result<()> {
        if self.cluster.partitioned.load(Ordering::Acquire) {
            return Err(Error::Replication("cluster partitioned".to_string()));
        }
        let payload = serde_json::to_vec(command)?;
        let started = Instant::now();

        for (address, handler, inbox) in self.targets() {
            let envelope = Envelope {
                origin: self.address,
                payload: payload.clone(),
            };
            match mode {
                DeliveryMode::Sync => {
                    self.cluster
                        .deliver(&handler, envelope)
                        .map_err(|e| Error::Replication(format!("member {} failed: {}", address, e)))?;
                    if started.elapsed() > timeout {
                        return Err(Error::Replication(format!(
                            "synchronous broadcast exceeded {:?}",
                            timeout
                        )));
                    }
                }
                DeliveryMode::Async => {
                    self.cluster.enqueued();
                    if inbox.send(envelope).is_err() {
                        self.cluster.completed();
                        debug!(member = %address, "member left before delivery");
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            self.stop();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fqn::Fqn;
    use assert_matches::assert_matches;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(Address, ReplicableCommand)>>,
        fail: AtomicBool,
    }

    impl RemoteCommandHandler for Recorder {
        fn handle_remote(&self, origin: Address, command: ReplicableCommand) -> Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(Error::InvalidState("refused".into()));
            }
            self.received.lock().push((origin, command));
            Ok(())
        }
    }

    fn start(transport: &InMemoryTransport, recorder: &Arc<Recorder>) {
        let handler: Arc<dyn RemoteCommandHandler> = recorder.clone();
        transport.start(Arc::downgrade(&handler)).unwrap();
    }

    fn remove(path: &str) -> ReplicableCommand {
        ReplicableCommand::RemoveNode {
            fqn: Fqn::from_string(path),
        }
    }

    #[test]
    fn test_sync_broadcast_reaches_other_members() {
        let cluster = InMemoryCluster::new();
        let (a, b) = (cluster.join(), cluster.join());
        let (ra, rb) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        start(&a, &ra);
        start(&b, &rb);
        assert_eq!(a.members().len(), 2);

        a.broadcast(&remove("/x"), DeliveryMode::Sync, Duration::from_secs(1))
            .unwrap();

        assert!(ra.received.lock().is_empty());
        let received = rb.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], (a.local_address(), remove("/x")));
    }

    #[test]
    fn test_sync_failure_is_replication_error() {
        let cluster = InMemoryCluster::new();
        let (a, b) = (cluster.join(), cluster.join());
        let (ra, rb) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        start(&a, &ra);
        start(&b, &rb);

        rb.fail.store(true, Ordering::Release);
        assert_matches!(
            a.broadcast(&remove("/x"), DeliveryMode::Sync, Duration::from_secs(1)),
            Err(Error::Replication(_))
        );

        rb.fail.store(false, Ordering::Release);
        cluster.set_partitioned(true);
        assert_matches!(
            a.broadcast(&remove("/x"), DeliveryMode::Async, Duration::from_secs(1)),
            Err(Error::Replication(_))
        );
    }

    #[test]
    fn test_async_broadcast_drains() {
        let cluster = InMemoryCluster::new();
        let (a, b) = (cluster.join(), cluster.join());
        let (ra, rb) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        start(&a, &ra);
        start(&b, &rb);

        for i in 0..10 {
            a.broadcast(&remove(&format!("/n{}", i)), DeliveryMode::Async, Duration::from_secs(1))
                .unwrap();
        }
        assert!(cluster.await_quiescence(Duration::from_secs(5)));
        assert_eq!(rb.received.lock().len(), 10);
        assert_eq!(cluster.delivered(), 10);
    }

    #[test]
    fn test_stop_leaves_cluster() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join();
        let ra = Arc::new(Recorder::default());
        start(&a, &ra);
        assert_matches!(
            a.start(Arc::downgrade(&(ra.clone() as Arc<dyn RemoteCommandHandler>))),
            Err(Error::InvalidState(_))
        );
        assert_eq!(cluster.member_count(), 1);
        a.stop();
        assert_eq!(cluster.member_count(), 0);
    }
}
