//! Error taxonomy for the cluster relay.
//!
//! None of these variants is fatal to the node: every error is surfaced as
//! an event and the coordinator keeps operating, possibly against a stale
//! topology until retries succeed.

/// Errors surfaced by the relay and coordinator.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    /// A channel's mapper resolved to an endpoint absent from a mapping
    /// context's connection set. Fan-out continues for other contexts.
    #[error("could not find a matching target server for the {channel} channel - the server may be down")]
    NoMatchingTarget { channel: String },

    /// Connection-level failure on a peer link.
    #[error("transport error on {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// A join or state report was not acknowledged by the state server.
    /// Always retried with fixed backoff.
    #[error("state server did not acknowledge {what}: {reason}")]
    AckFailure {
        what: &'static str,
        reason: String,
    },

    /// A peer URI could not be parsed into an endpoint.
    #[error("invalid peer endpoint uri: {uri}")]
    InvalidEndpoint { uri: String },

    /// The channel mapper was invoked with zero peers.
    #[error("channel mapper invoked with an empty peer list")]
    EmptyPeerList,
}

impl RelayError {
    pub fn no_matching_target(channel: &str) -> Self {
        Self::NoMatchingTarget {
            channel: channel.to_string(),
        }
    }

    pub fn transport(endpoint: &str, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}
