//! The convergence coordinator.
//!
//! One task owns every piece of mutable state (mapper stacks, snapshot
//! tracker, dedup cache, publish buffer) and mutates it only in response
//! to discrete events, so convergence transitions are serialized without
//! locks. Publish acks run on spawned tasks and never block the loop;
//! retry timers are realized as delayed self-events guarded by generation
//! counters, so a superseded retry is dropped instead of racing.
//!
//! Protocol per membership change: push the new subscription topology and
//! report `updatedSubs`; once the whole cluster converged on that, push
//! the new publish topology (retiring older publish contexts) and report
//! `updatedPubs`; once converged again, retire all but the newest context
//! in both stacks and report `active`. Subscribing under a topology
//! strictly before anyone publishes under it is what keeps messages from
//! being dropped mid-migration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::LocalBroker;
use crate::config::ClusterClientConfig;
use crate::control::{ControlEvent, ControlLink, NodeDescriptor};
use crate::convergence::{SnapshotTracker, Stage};
use crate::dedup::DedupCache;
use crate::error::RelayError;
use crate::mapper::{ChannelMapper, ShardMapper};
use crate::pool::ConnectionPool;
use crate::relay::{ClusterRelay, ErrorSink};
use crate::transport::{LinkEvent, MessagePacket, PeerConnector};

/// Capacity of the coordinator's event queues.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Events consumed by the coordinator loop.
#[derive(Debug)]
pub(crate) enum CoordinatorEvent {
    /// Local broker gained a subscriber for `channel`.
    Subscribe { channel: String },
    /// Local broker lost its subscribers for `channel`.
    Unsubscribe { channel: String },
    /// Local broker published a payload to forward into the cluster.
    Publish {
        channel: String,
        payload: serde_json::Value,
    },
    /// Delayed re-attempt of a failed cluster join.
    RetryJoin { generation: u64 },
    /// Delayed re-send of a failed state report (same state string).
    RetryReport { state: String, generation: u64 },
    /// Point-in-time view of the mapping state.
    Inspect { reply: oneshot::Sender<ClientStats> },
    /// Stop the loop.
    Shutdown,
}

/// Snapshot of the coordinator's mapping state, for observability and
/// invariant checks (stack lengths are normally 1, transiently 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    /// Most recently reached convergence stage.
    pub stage: Stage,
    pub sub_stack_len: usize,
    pub pub_stack_len: usize,
    pub pooled_endpoints: Vec<String>,
}

pub(crate) struct Coordinator {
    broker: Arc<dyn LocalBroker>,
    control: Arc<dyn ControlLink>,
    config: ClusterClientConfig,
    descriptor: NodeDescriptor,
    mapper: Arc<dyn ChannelMapper>,
    relay: ClusterRelay,
    snapshot: SnapshotTracker,
    stage: Stage,
    dedup: DedupCache,
    errors: ErrorSink,
    publish_buffer: HashMap<String, Vec<serde_json::Value>>,
    flush_deadline: Option<Instant>,
    join_generation: u64,
    report_generation: u64,
    /// Self-handle used to schedule delayed retry events.
    events_tx: mpsc::Sender<CoordinatorEvent>,
}

impl Coordinator {
    /// Wire up the relay and start the coordinator task.
    pub(crate) fn spawn(
        broker: Arc<dyn LocalBroker>,
        control: Arc<dyn ControlLink>,
        connector: Arc<dyn PeerConnector>,
        config: ClusterClientConfig,
        error_observer: Option<mpsc::UnboundedSender<RelayError>>,
    ) -> (mpsc::Sender<CoordinatorEvent>, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (link_tx, link_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let errors = ErrorSink::new(config.suppress_error_logging, error_observer);
        let pool = ConnectionPool::new(connector, config.auth_key.clone(), link_tx);
        let relay = ClusterRelay::new(broker.clone(), pool, errors.clone());
        let descriptor = NodeDescriptor {
            instance_id: broker.instance_id().to_string(),
            instance_ip: config.cluster_instance_ip.clone(),
            instance_ip_family: config.cluster_instance_ip_family.clone(),
        };

        let coordinator = Self {
            broker,
            control,
            dedup: DedupCache::new(config.message_cache_ttl),
            config,
            descriptor,
            mapper: Arc::new(ShardMapper),
            relay,
            snapshot: SnapshotTracker::new(),
            stage: Stage::Joining,
            errors,
            publish_buffer: HashMap::new(),
            flush_deadline: None,
            join_generation: 0,
            report_generation: 0,
            events_tx: events_tx.clone(),
        };

        let task = tokio::spawn(coordinator.run(events_rx, link_rx));
        (events_tx, task)
    }

    async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<CoordinatorEvent>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
    ) {
        let control = self.control.clone();
        let sweep_period = self.config.message_cache_ttl.max(Duration::from_millis(1));
        let mut dedup_sweep = tokio::time::interval(sweep_period);
        let mut control_gone = false;

        loop {
            let flush_at = self.flush_deadline;
            tokio::select! {
                maybe_event = events_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if !self.handle_event(event).await {
                                break;
                            }
                        }
                        // Every handle dropped: shut down.
                        None => break,
                    }
                }
                maybe_link = link_rx.recv() => {
                    if let Some(link_event) = maybe_link {
                        self.handle_link_event(link_event).await;
                    }
                }
                maybe_control = control.next_event(), if !control_gone => {
                    match maybe_control {
                        Some(event) => self.handle_control_event(event).await,
                        None => control_gone = true,
                    }
                }
                _ = dedup_sweep.tick() => self.dedup.purge_expired(),
                _ = async {
                    match flush_at {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => self.flush_publish_buffer().await,
            }
        }
        tracing::debug!("cluster coordinator stopped");
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) -> bool {
        match event {
            CoordinatorEvent::Subscribe { channel } => self.relay.subscribe(&channel).await,
            CoordinatorEvent::Unsubscribe { channel } => self.relay.unsubscribe(&channel).await,
            CoordinatorEvent::Publish { channel, payload } => {
                self.handle_outbound_publish(channel, payload)
            }
            CoordinatorEvent::RetryJoin { generation } => {
                if generation == self.join_generation {
                    self.join_cluster().await;
                }
            }
            CoordinatorEvent::RetryReport { state, generation } => {
                if generation == self.report_generation {
                    self.send_report(state, generation).await;
                }
            }
            CoordinatorEvent::Inspect { reply } => {
                let mut pooled_endpoints = self.relay.pooled_endpoints();
                pooled_endpoints.sort();
                let _ = reply.send(ClientStats {
                    stage: self.stage,
                    sub_stack_len: self.relay.sub_stack_len(),
                    pub_stack_len: self.relay.pub_stack_len(),
                    pooled_endpoints,
                });
            }
            CoordinatorEvent::Shutdown => return false,
        }
        true
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Message { channel, packet } => {
                self.handle_cluster_message(&channel, packet).await;
            }
            LinkEvent::Error(err) => self.errors.report(err),
        }
    }

    async fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Connected => {
                self.join_generation += 1;
                self.stage = Stage::Joining;
                self.join_cluster().await;
            }
            ControlEvent::ServerJoinCluster(snapshot)
            | ControlEvent::ServerLeaveCluster(snapshot) => {
                if self.snapshot.accept(&snapshot) {
                    let peers = self.snapshot.peers().to_vec();
                    self.relay.sub_mapper_push(self.mapper.clone(), peers).await;
                    self.report(Stage::UpdatedSubs).await;
                }
            }
            ControlEvent::StatesConverge { state } => {
                if self
                    .snapshot
                    .matches_converged_state(Stage::UpdatedSubs, &state)
                {
                    let peers = self.snapshot.peers().to_vec();
                    self.relay.pub_mapper_push(self.mapper.clone(), peers).await;
                    while self.relay.pub_stack_len() > 1 {
                        self.relay.pub_mapper_shift().await;
                    }
                    self.report(Stage::UpdatedPubs).await;
                } else if self
                    .snapshot
                    .matches_converged_state(Stage::UpdatedPubs, &state)
                {
                    self.complete_mapping_updates().await;
                }
                // Anything else is a stale round, superseded by a newer
                // snapshot on this node.
            }
        }
    }

    /// Announce this node to the state server; on acknowledgment, rebuild
    /// all local state from the returned snapshot.
    async fn join_cluster(&mut self) {
        match self.control.join_cluster(&self.descriptor).await {
            Ok(snapshot) => {
                self.reset_state().await;
                self.snapshot.accept(&snapshot);
                let peers = self.snapshot.peers().to_vec();
                self.relay
                    .sub_mapper_push(self.mapper.clone(), peers.clone())
                    .await;
                self.relay.pub_mapper_push(self.mapper.clone(), peers).await;
                self.report(Stage::Active).await;
            }
            Err(err) => {
                self.errors.report(err);
                self.schedule(
                    CoordinatorEvent::RetryJoin {
                        generation: self.join_generation,
                    },
                    self.config.retry_delay,
                );
            }
        }
    }

    async fn reset_state(&mut self) {
        while self.relay.pub_stack_len() > 0 {
            self.relay.pub_mapper_shift().await;
        }
        while self.relay.sub_stack_len() > 0 {
            self.relay.sub_mapper_shift().await;
        }
        self.snapshot.reset();
        self.dedup.clear();
    }

    /// All nodes converged on `updatedPubs`: drop every topology except
    /// the newest in both stacks and report `active`.
    async fn complete_mapping_updates(&mut self) {
        while self.relay.pub_stack_len() > 1 {
            self.relay.pub_mapper_shift().await;
        }
        while self.relay.sub_stack_len() > 1 {
            self.relay.sub_mapper_shift().await;
        }
        self.report(Stage::Active).await;
    }

    /// Report this node's stage for the held snapshot. Supersedes any
    /// pending retry of an earlier report.
    async fn report(&mut self, stage: Stage) {
        self.stage = stage;
        self.report_generation += 1;
        let state = self.snapshot.state_string(stage);
        self.send_report(state, self.report_generation).await;
    }

    async fn send_report(&mut self, state: String, generation: u64) {
        if let Err(err) = self.control.set_state(&state).await {
            self.errors.report(err);
            self.schedule(
                CoordinatorEvent::RetryReport { state, generation },
                self.config.retry_delay,
            );
        }
    }

    /// Deliver an inbound cluster packet locally unless it is our own
    /// (loop prevention) or already seen (duplicate path during
    /// migration). Every sighting re-arms the id's TTL.
    async fn handle_cluster_message(&mut self, channel: &str, packet: MessagePacket) {
        if packet.sender.as_deref() == Some(self.broker.instance_id()) {
            return;
        }
        if packet.messages.is_empty() {
            return;
        }
        if !self.dedup.observe(&packet.id) {
            for payload in packet.messages {
                self.broker.deliver(channel, payload).await;
            }
        }
    }

    fn handle_outbound_publish(&mut self, channel: String, payload: serde_json::Value) {
        match self.config.publish_batch_window {
            None => {
                let packet = self.wrap_packet(vec![payload]);
                self.dispatch_publish(&channel, packet);
            }
            Some(window) => {
                self.publish_buffer.entry(channel).or_default().push(payload);
                if self.flush_deadline.is_none() {
                    self.flush_deadline = Some(Instant::now() + window);
                }
            }
        }
    }

    /// Send one packet per buffered channel, coalescing every payload
    /// that arrived within the batching window.
    async fn flush_publish_buffer(&mut self) {
        self.flush_deadline = None;
        let buffered = std::mem::take(&mut self.publish_buffer);
        for (channel, messages) in buffered {
            let packet = self.wrap_packet(messages);
            self.dispatch_publish(&channel, packet);
        }
    }

    fn wrap_packet(&self, messages: Vec<serde_json::Value>) -> MessagePacket {
        let instance_id = self.broker.instance_id();
        MessagePacket {
            sender: (!instance_id.is_empty()).then(|| instance_id.to_string()),
            messages,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Resolve the fan-out targets on the loop, then run the sends on
    /// their own task so publish acks never block unrelated work.
    fn dispatch_publish(&self, channel: &str, packet: MessagePacket) {
        let connections = self.relay.resolve_publish_targets(channel);
        if connections.is_empty() {
            return;
        }
        let errors = self.errors.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            for connection in connections {
                if let Err(err) = connection.link.publish(&channel, &packet).await {
                    errors.report(err);
                }
            }
        });
    }

    fn schedule(&self, event: CoordinatorEvent, delay: Duration) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(event).await;
        });
    }
}
