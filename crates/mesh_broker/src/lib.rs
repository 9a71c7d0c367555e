//! Cluster topology coordinator for a sharded pub/sub broker mesh.
//!
//! A broker node participates in a multi-node cluster where channels are
//! sharded across a changing set of peer broker endpoints. Channels are
//! routed with a deterministic hash over an ordered peer list, so every
//! node independently resolves the same owner for a channel; when
//! membership changes, a staged convergence protocol keeps the old and
//! new topologies simultaneously subscribed until the whole cluster has
//! caught up, so no in-flight message is dropped. Duplicates picked up
//! through the overlapping paths are suppressed by a TTL cache, as are a
//! node's own published messages looping back.
//!
//! External collaborators sit behind traits: the peer socket transport
//! ([`PeerConnector`]/[`PeerLink`]), the central state server
//! ([`ControlLink`]), and the node-local broker ([`LocalBroker`]).
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mesh_broker::{ClusterClient, ClusterClientConfig};
//! # fn demo(
//! #     broker: Arc<dyn mesh_broker::LocalBroker>,
//! #     control: Arc<dyn mesh_broker::ControlLink>,
//! #     connector: Arc<dyn mesh_broker::PeerConnector>,
//! # ) {
//! let client = ClusterClient::spawn(broker, control, connector, ClusterClientConfig::default());
//! # drop(client);
//! # }
//! ```

mod broker;
mod config;
mod control;
mod convergence;
mod coordinator;
mod dedup;
mod endpoint;
mod error;
mod mapper;
mod pool;
mod relay;
mod transport;

pub use broker::LocalBroker;
pub use config::{
    ClusterClientConfig, DEFAULT_MESSAGE_CACHE_TTL, DEFAULT_RECONNECT_RANDOMNESS,
    DEFAULT_RETRY_DELAY, DEFAULT_STATE_SERVER_ACK_TIMEOUT, DEFAULT_STATE_SERVER_CONNECT_TIMEOUT,
    DEFAULT_STATE_SERVER_PORT,
};
pub use control::{ClusterSnapshot, ControlEvent, ControlLink, NodeDescriptor};
pub use convergence::{SnapshotTracker, Stage};
pub use endpoint::PeerEndpoint;
pub use error::RelayError;
pub use mapper::{map_channel, ChannelMapper, ShardMapper};
pub use transport::{LinkEvent, MessagePacket, PeerConnector, PeerLink};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use coordinator::{Coordinator, CoordinatorEvent};
pub use coordinator::ClientStats;

/// Handle to a running cluster client.
///
/// Spawns the coordinator task and forwards the local broker's channel
/// interest and publishes into it. Dropping the handle (or calling
/// [`ClusterClient::shutdown`]) stops the task.
pub struct ClusterClient {
    events_tx: mpsc::Sender<CoordinatorEvent>,
    task: Option<JoinHandle<()>>,
}

impl ClusterClient {
    /// Start a cluster client over the given collaborators.
    pub fn spawn(
        broker: Arc<dyn LocalBroker>,
        control: Arc<dyn ControlLink>,
        connector: Arc<dyn PeerConnector>,
        config: ClusterClientConfig,
    ) -> Self {
        Self::spawn_with_error_observer(broker, control, connector, config, None)
    }

    /// Like [`ClusterClient::spawn`], additionally forwarding every
    /// non-fatal relay error to `observer`.
    pub fn spawn_with_error_observer(
        broker: Arc<dyn LocalBroker>,
        control: Arc<dyn ControlLink>,
        connector: Arc<dyn PeerConnector>,
        config: ClusterClientConfig,
        observer: Option<mpsc::UnboundedSender<RelayError>>,
    ) -> Self {
        let (events_tx, task) = Coordinator::spawn(broker, control, connector, config, observer);
        Self {
            events_tx,
            task: Some(task),
        }
    }

    /// The local broker gained a subscriber for `channel`.
    pub async fn subscribe(&self, channel: &str) {
        self.send(CoordinatorEvent::Subscribe {
            channel: channel.to_string(),
        })
        .await;
    }

    /// The local broker lost its subscribers for `channel`.
    pub async fn unsubscribe(&self, channel: &str) {
        self.send(CoordinatorEvent::Unsubscribe {
            channel: channel.to_string(),
        })
        .await;
    }

    /// Forward a locally published payload into the cluster.
    pub async fn publish(&self, channel: &str, payload: serde_json::Value) {
        self.send(CoordinatorEvent::Publish {
            channel: channel.to_string(),
            payload,
        })
        .await;
    }

    /// Current mapping-state snapshot, or `None` once the coordinator is
    /// gone.
    pub async fn stats(&self) -> Option<ClientStats> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.send(CoordinatorEvent::Inspect { reply: reply_tx }).await;
        reply_rx.await.ok()
    }

    /// Stop the coordinator task and wait for it to finish.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let _ = self.events_tx.send(CoordinatorEvent::Shutdown).await;
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|err| anyhow::anyhow!("cluster coordinator task join failed: {err}"))?;
        }
        Ok(())
    }

    async fn send(&self, event: CoordinatorEvent) {
        if self.events_tx.send(event).await.is_err() {
            tracing::debug!("cluster coordinator is gone; event dropped");
        }
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            // The loop also exits once every event sender is dropped;
            // aborting here just makes shutdown prompt.
            task.abort();
        }
    }
}
