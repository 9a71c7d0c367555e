//! Central state-server contract.
//!
//! The state server tracks cluster membership and relays every node's
//! convergence reports. It is an RPC peer with a fixed message contract;
//! the trait below is what the coordinator needs from whatever transport
//! implements it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// A membership snapshot as announced by the state server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Ordered peer broker URIs; the ordering is part of the mapping input.
    #[serde(rename = "serverInstances")]
    pub server_instances: Vec<String>,
    /// Server-side timestamp; snapshots are only accepted monotonically.
    pub time: i64,
}

/// This node's descriptor, sent when joining the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(rename = "instanceIp", skip_serializing_if = "Option::is_none")]
    pub instance_ip: Option<String>,
    #[serde(rename = "instanceIpFamily", skip_serializing_if = "Option::is_none")]
    pub instance_ip_family: Option<String>,
}

/// Inbound notifications from the state server.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Contact (re)established; the coordinator announces its join intent.
    Connected,
    /// A broker joined the cluster.
    ServerJoinCluster(ClusterSnapshot),
    /// A broker left the cluster.
    ServerLeaveCluster(ClusterSnapshot),
    /// All nodes converged on the carried composite state string.
    StatesConverge { state: String },
}

/// Client side of the state-server protocol.
#[async_trait]
pub trait ControlLink: Send + Sync {
    /// `clientJoinCluster`: announce this node and fetch the current
    /// snapshot. Retried by the coordinator on failure.
    async fn join_cluster(&self, descriptor: &NodeDescriptor)
        -> Result<ClusterSnapshot, RelayError>;

    /// `clientSetState`: report this node's composite convergence state.
    /// Idempotent; retried by the coordinator with the same string.
    async fn set_state(&self, instance_state: &str) -> Result<(), RelayError>;

    /// Next inbound control notification, or `None` once the link is gone.
    async fn next_event(&self) -> Option<ControlEvent>;
}
