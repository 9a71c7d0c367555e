//! Peer transport contract.
//!
//! The bidirectional socket transport to peer brokers is an external
//! collaborator; the relay only depends on the two traits below. A real
//! implementation wraps one socket per peer endpoint and routes watched
//! channels' inbound traffic into the coordinator through the `LinkEvent`
//! sink handed to `PeerConnector::connect`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::endpoint::PeerEndpoint;
use crate::error::RelayError;

/// One logical cluster message as carried between brokers.
///
/// Wire field names are fixed by the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePacket {
    /// Instance id of the publishing node, used for loop prevention.
    pub sender: Option<String>,
    /// One or more payloads for the packet's channel.
    pub messages: Vec<serde_json::Value>,
    /// Unique packet id, used for duplicate suppression.
    pub id: String,
}

/// Event pushed from a peer connection into the coordinator.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A message arrived on a watched channel.
    Message {
        channel: String,
        packet: MessagePacket,
    },
    /// A connection-level error, republished as a coordinator error event.
    Error(RelayError),
}

/// A live connection to one peer broker.
///
/// Implementations must keep watched channels flowing into the `LinkEvent`
/// sink supplied at connect time until `unwatch` or `disconnect`.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), RelayError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), RelayError>;
    /// Start consuming the channel's messages on this connection.
    async fn watch(&self, channel: &str) -> Result<(), RelayError>;
    async fn unwatch(&self, channel: &str) -> Result<(), RelayError>;
    async fn publish(&self, channel: &str, packet: &MessagePacket) -> Result<(), RelayError>;
    async fn disconnect(&self);
}

/// Opens connections to peer endpoints.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        auth_key: Option<&str>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_wire_format_uses_protocol_field_names() {
        let packet = MessagePacket {
            sender: Some("node-1".to_string()),
            messages: vec![serde_json::json!({"qty": 3})],
            id: "f81d4fae-7dec-11d0-a765-00a0c91e6bf6".to_string(),
        };
        let encoded = serde_json::to_value(&packet).expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({
                "sender": "node-1",
                "messages": [{"qty": 3}],
                "id": "f81d4fae-7dec-11d0-a765-00a0c91e6bf6",
            })
        );

        let decoded: MessagePacket = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn packet_sender_may_be_absent() {
        let decoded: MessagePacket = serde_json::from_value(serde_json::json!({
            "sender": null,
            "messages": [],
            "id": "x",
        }))
        .expect("decode");
        assert_eq!(decoded.sender, None);
        assert!(decoded.messages.is_empty());
    }
}
