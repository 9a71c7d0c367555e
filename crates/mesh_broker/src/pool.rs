//! Target connection pool.
//!
//! One long-lived connection per distinct peer endpoint, shared by every
//! mapping context that references it. The relay calls
//! [`ConnectionPool::release_unreferenced`] after every stack mutation so
//! a connection is torn down the instant nothing references its endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::endpoint::PeerEndpoint;
use crate::error::RelayError;
use crate::transport::{LinkEvent, PeerConnector, PeerLink};

/// A pooled connection to one peer endpoint, plus the channel bookkeeping
/// the relay needs to decide when to watch and when to unsubscribe.
pub struct TargetConnection {
    /// Endpoint identity (the peer's URI string).
    pub uri: String,
    pub link: Arc<dyn PeerLink>,
    /// Channels with a message consumer registered on this connection.
    watched: Mutex<HashSet<String>>,
    /// Channels currently subscribed on this connection.
    subscribed: Mutex<HashSet<String>>,
}

impl TargetConnection {
    fn new(uri: String, link: Arc<dyn PeerLink>) -> Self {
        Self {
            uri,
            link,
            watched: Mutex::new(HashSet::new()),
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    fn locked(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
        set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a subscription; returns false if it was already present.
    pub fn note_subscribed(&self, channel: &str) -> bool {
        Self::locked(&self.subscribed).insert(channel.to_string())
    }

    pub fn note_unsubscribed(&self, channel: &str) {
        Self::locked(&self.subscribed).remove(channel);
    }

    /// Record a watcher; returns true if this connection had none for the
    /// channel (i.e. the caller should register one on the link).
    pub fn note_watched(&self, channel: &str) -> bool {
        Self::locked(&self.watched).insert(channel.to_string())
    }

    pub fn note_unwatched(&self, channel: &str) {
        Self::locked(&self.watched).remove(channel);
    }

    /// Snapshot of the channels subscribed on this connection.
    pub fn subscriptions(&self) -> Vec<String> {
        Self::locked(&self.subscribed).iter().cloned().collect()
    }
}

impl std::fmt::Debug for TargetConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConnection")
            .field("uri", &self.uri)
            .finish()
    }
}

/// Owns every live peer connection, keyed by endpoint URI.
pub struct ConnectionPool {
    connector: Arc<dyn PeerConnector>,
    auth_key: Option<String>,
    /// Shared inbound sink cloned into every connection at connect time.
    link_events: mpsc::Sender<LinkEvent>,
    connections: HashMap<String, Arc<TargetConnection>>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        auth_key: Option<String>,
        link_events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            connector,
            auth_key,
            link_events,
            connections: HashMap::new(),
        }
    }

    /// Return the pooled connection for `uri`, opening one if absent.
    pub async fn acquire(&mut self, uri: &str) -> Result<Arc<TargetConnection>, RelayError> {
        if let Some(existing) = self.connections.get(uri) {
            return Ok(existing.clone());
        }

        let endpoint = PeerEndpoint::parse(uri)?;
        let link = self
            .connector
            .connect(&endpoint, self.auth_key.as_deref(), self.link_events.clone())
            .await?;
        let connection = Arc::new(TargetConnection::new(uri.to_string(), link));
        self.connections.insert(uri.to_string(), connection.clone());
        tracing::debug!(endpoint = %uri, "opened target connection");
        Ok(connection)
    }

    /// Disconnect and drop every connection whose endpoint is not in
    /// `referenced`. Must run after every mapper push and shift.
    pub async fn release_unreferenced(&mut self, referenced: &HashSet<String>) {
        let stale: Vec<String> = self
            .connections
            .keys()
            .filter(|uri| !referenced.contains(*uri))
            .cloned()
            .collect();

        for uri in stale {
            if let Some(connection) = self.connections.remove(&uri) {
                connection.link.disconnect().await;
                tracing::debug!(endpoint = %uri, "released unreferenced target connection");
            }
        }
    }

    /// Endpoints currently held by the pool.
    pub fn endpoints(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }
}
