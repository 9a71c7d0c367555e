//! Local broker contract.
//!
//! The node's own broker (storage and delivery to local subscribers) is an
//! external collaborator. The coordinator reads its identity and channel
//! interest and pushes inbound cluster payloads back into it.

use async_trait::async_trait;

/// Callback interface to the node-local broker.
#[async_trait]
pub trait LocalBroker: Send + Sync {
    /// Stable instance id of this node, carried as the packet sender for
    /// loop prevention.
    fn instance_id(&self) -> &str;

    /// Channels the local broker currently has subscribers for.
    fn subscriptions(&self) -> Vec<String>;

    /// Deliver one inbound payload to local subscribers of `channel`.
    async fn deliver(&self, channel: &str, payload: serde_json::Value);
}
