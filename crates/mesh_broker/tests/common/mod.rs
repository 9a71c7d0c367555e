//! Shared in-memory fakes for integration tests: a peer mesh, a
//! scriptable state server, and a recording local broker.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use mesh_broker::{
    ClusterSnapshot, ControlEvent, ControlLink, LinkEvent, LocalBroker, MessagePacket,
    NodeDescriptor, PeerConnector, PeerEndpoint, PeerLink, RelayError,
};

/// Poll interval for the wait helpers.
const POLL: Duration = Duration::from_millis(10);

/// Best-effort tracing init so `RUST_LOG` works under `cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Remote-side view of one fake peer connection.
pub struct PeerState {
    pub uri: String,
    pub subscribed: Mutex<HashSet<String>>,
    pub watched: Mutex<HashSet<String>>,
    pub published: Mutex<Vec<(String, MessagePacket)>>,
    pub disconnected: AtomicBool,
    events: mpsc::Sender<LinkEvent>,
}

impl PeerState {
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed.lock().expect("subscribed").contains(channel)
    }

    pub fn is_watched(&self, channel: &str) -> bool {
        self.watched.lock().expect("watched").contains(channel)
    }

    pub fn published_on(&self, channel: &str) -> Vec<MessagePacket> {
        self.published
            .lock()
            .expect("published")
            .iter()
            .filter(|(ch, _)| ch == channel)
            .map(|(_, packet)| packet.clone())
            .collect()
    }
}

struct MeshLink {
    state: Arc<PeerState>,
}

#[async_trait]
impl PeerLink for MeshLink {
    async fn subscribe(&self, channel: &str) -> Result<(), RelayError> {
        self.state
            .subscribed
            .lock()
            .expect("subscribed")
            .insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), RelayError> {
        self.state
            .subscribed
            .lock()
            .expect("subscribed")
            .remove(channel);
        Ok(())
    }

    async fn watch(&self, channel: &str) -> Result<(), RelayError> {
        self.state
            .watched
            .lock()
            .expect("watched")
            .insert(channel.to_string());
        Ok(())
    }

    async fn unwatch(&self, channel: &str) -> Result<(), RelayError> {
        self.state
            .watched
            .lock()
            .expect("watched")
            .remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, packet: &MessagePacket) -> Result<(), RelayError> {
        self.state
            .published
            .lock()
            .expect("published")
            .push((channel.to_string(), packet.clone()));
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.disconnected.store(true, Ordering::SeqCst);
    }
}

/// In-memory peer mesh implementing the connector seam.
#[derive(Clone, Default)]
pub struct FakeMesh {
    peers: Arc<Mutex<HashMap<String, Arc<PeerState>>>>,
}

impl FakeMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self, uri: &str) -> Option<Arc<PeerState>> {
        self.peers.lock().expect("peers").get(uri).cloned()
    }

    /// Wait until a connection to `uri` exists and return it.
    pub async fn wait_for_peer(&self, uri: &str, timeout: Duration) -> Arc<PeerState> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(peer) = self.peer(uri) {
                return peer;
            }
            assert!(
                Instant::now() < deadline,
                "no connection to {uri} within {timeout:?}"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// Deliver a packet from the mesh to the node under test, as the real
    /// transport would for a watched channel. Returns false when the
    /// channel is not watched on that connection.
    pub async fn deliver(&self, uri: &str, channel: &str, packet: MessagePacket) -> bool {
        let Some(peer) = self.peer(uri) else {
            return false;
        };
        if !peer.is_watched(channel) {
            return false;
        }
        peer.events
            .send(LinkEvent::Message {
                channel: channel.to_string(),
                packet,
            })
            .await
            .is_ok()
    }
}

#[async_trait]
impl PeerConnector for FakeMesh {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        _auth_key: Option<&str>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, RelayError> {
        let state = Arc::new(PeerState {
            uri: endpoint.uri.clone(),
            subscribed: Mutex::new(HashSet::new()),
            watched: Mutex::new(HashSet::new()),
            published: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            events,
        });
        self.peers
            .lock()
            .expect("peers")
            .insert(endpoint.uri.clone(), state.clone());
        Ok(Arc::new(MeshLink { state }))
    }
}

/// Scriptable state server: queued join responses, scripted report
/// failures, and a channel of injected control events.
pub struct FakeControl {
    join_responses: Mutex<VecDeque<Result<ClusterSnapshot, RelayError>>>,
    pub join_calls: AtomicUsize,
    report_failures: Mutex<VecDeque<RelayError>>,
    reports: Mutex<Vec<String>>,
    report_notify: Notify,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlEvent>>,
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            join_responses: Mutex::new(VecDeque::new()),
            join_calls: AtomicUsize::new(0),
            report_failures: Mutex::new(VecDeque::new()),
            reports: Mutex::new(Vec::new()),
            report_notify: Notify::new(),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        })
    }

    pub fn queue_join_response(&self, response: Result<ClusterSnapshot, RelayError>) {
        self.join_responses
            .lock()
            .expect("join responses")
            .push_back(response);
    }

    /// Make the next `set_state` call fail with `err`.
    pub fn queue_report_failure(&self, err: RelayError) {
        self.report_failures
            .lock()
            .expect("report failures")
            .push_back(err);
    }

    pub fn inject(&self, event: ControlEvent) {
        self.events_tx.send(event).expect("coordinator gone");
    }

    /// Every `clientSetState` attempt, in order (including failed ones).
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().expect("reports").clone()
    }

    pub async fn wait_for_report(&self, expected: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reports().iter().any(|state| state == expected) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "no report {expected:?} within {timeout:?}; saw {:?}",
                self.reports()
            );
            let _ = tokio::time::timeout(POLL, self.report_notify.notified()).await;
        }
    }
}

#[async_trait]
impl ControlLink for FakeControl {
    async fn join_cluster(
        &self,
        _descriptor: &NodeDescriptor,
    ) -> Result<ClusterSnapshot, RelayError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        self.join_responses
            .lock()
            .expect("join responses")
            .pop_front()
            .unwrap_or_else(|| {
                Err(RelayError::AckFailure {
                    what: "clientJoinCluster",
                    reason: "no scripted response".to_string(),
                })
            })
    }

    async fn set_state(&self, instance_state: &str) -> Result<(), RelayError> {
        self.reports
            .lock()
            .expect("reports")
            .push(instance_state.to_string());
        self.report_notify.notify_waiters();
        if let Some(err) = self
            .report_failures
            .lock()
            .expect("report failures")
            .pop_front()
        {
            return Err(err);
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<ControlEvent> {
        self.events_rx.lock().await.recv().await
    }
}

/// Local broker recording deliveries.
pub struct RecordingBroker {
    instance: String,
    pub local_channels: Mutex<Vec<String>>,
    pub delivered: Mutex<Vec<(String, serde_json::Value)>>,
    delivery_notify: Notify,
}

impl RecordingBroker {
    pub fn new(instance: &str) -> Arc<Self> {
        Arc::new(Self {
            instance: instance.to_string(),
            local_channels: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            delivery_notify: Notify::new(),
        })
    }

    pub fn delivered_on(&self, channel: &str) -> Vec<serde_json::Value> {
        self.delivered
            .lock()
            .expect("delivered")
            .iter()
            .filter(|(ch, _)| ch == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub async fn wait_for_deliveries(&self, channel: &str, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.delivered_on(channel).len() >= count {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "fewer than {count} deliveries on {channel} within {timeout:?}"
            );
            let _ = tokio::time::timeout(POLL, self.delivery_notify.notified()).await;
        }
    }
}

#[async_trait]
impl LocalBroker for RecordingBroker {
    fn instance_id(&self) -> &str {
        &self.instance
    }

    fn subscriptions(&self) -> Vec<String> {
        self.local_channels.lock().expect("local channels").clone()
    }

    async fn deliver(&self, channel: &str, payload: serde_json::Value) {
        self.delivered
            .lock()
            .expect("delivered")
            .push((channel.to_string(), payload));
        self.delivery_notify.notify_waiters();
    }
}

pub fn snapshot(peers: &[&str], time: i64) -> ClusterSnapshot {
    ClusterSnapshot {
        server_instances: peers.iter().map(|p| p.to_string()).collect(),
        time,
    }
}

/// Composite `"<stage>:<peers json>"` string as the protocol renders it.
pub fn state_string(stage: &str, peers: &[&str]) -> String {
    let peers: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
    format!(
        "{stage}:{}",
        serde_json::to_string(&peers).expect("peer list json")
    )
}

pub fn packet(sender: Option<&str>, id: &str, messages: &[serde_json::Value]) -> MessagePacket {
    MessagePacket {
        sender: sender.map(|s| s.to_string()),
        messages: messages.to_vec(),
        id: id.to_string(),
    }
}

/// Poll until `predicate` holds, panicking at the deadline.
pub async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, predicate: F) {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(POLL).await;
    }
}
