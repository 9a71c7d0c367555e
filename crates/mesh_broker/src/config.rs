//! Cluster client configuration.

use std::time::Duration;

use rand::Rng;

/// Default state-server port.
pub const DEFAULT_STATE_SERVER_PORT: u16 = 7777;
/// Default dedup cache TTL.
pub const DEFAULT_MESSAGE_CACHE_TTL: Duration = Duration::from_millis(10_000);
/// Default fixed delay for join/report retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(2_000);
/// Default state-server connect timeout.
pub const DEFAULT_STATE_SERVER_CONNECT_TIMEOUT: Duration = Duration::from_millis(3_000);
/// Default state-server ack timeout.
pub const DEFAULT_STATE_SERVER_ACK_TIMEOUT: Duration = Duration::from_millis(2_000);
/// Default jitter bound added to reconnect delays.
pub const DEFAULT_RECONNECT_RANDOMNESS: Duration = Duration::from_millis(1_000);

/// Knobs recognized by the cluster client.
///
/// The connect/ack timeouts and reconnect jitter configure the underlying
/// control-socket transport; they are carried here so a `ControlLink`
/// implementation has one place to read them from.
#[derive(Debug, Clone)]
pub struct ClusterClientConfig {
    /// Credential forwarded to peer connections and the state server.
    pub auth_key: Option<String>,
    /// State-server host. Required for a live deployment.
    pub state_server_host: String,
    pub state_server_port: u16,
    /// Advertised IP carried in this node's join descriptor.
    pub cluster_instance_ip: Option<String>,
    /// Advertised IP family (`"IPv4"` / `"IPv6"`) for the join descriptor.
    pub cluster_instance_ip_family: Option<String>,
    pub state_server_connect_timeout: Duration,
    pub state_server_ack_timeout: Duration,
    /// Fixed delay between join/report retries.
    pub retry_delay: Duration,
    /// Upper bound of the random jitter added to reconnect delays.
    pub reconnect_randomness: Duration,
    /// How long a seen packet id suppresses duplicates.
    pub message_cache_ttl: Duration,
    /// Outbound publish batching window. `None` sends one payload per
    /// packet immediately.
    pub publish_batch_window: Option<Duration>,
    /// Demote non-fatal relay errors from `warn` to `debug` logs.
    pub suppress_error_logging: bool,
}

impl Default for ClusterClientConfig {
    fn default() -> Self {
        Self {
            auth_key: None,
            state_server_host: String::new(),
            state_server_port: DEFAULT_STATE_SERVER_PORT,
            cluster_instance_ip: None,
            cluster_instance_ip_family: None,
            state_server_connect_timeout: DEFAULT_STATE_SERVER_CONNECT_TIMEOUT,
            state_server_ack_timeout: DEFAULT_STATE_SERVER_ACK_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            reconnect_randomness: DEFAULT_RECONNECT_RANDOMNESS,
            message_cache_ttl: DEFAULT_MESSAGE_CACHE_TTL,
            publish_batch_window: None,
            suppress_error_logging: false,
        }
    }
}

impl ClusterClientConfig {
    /// Reconnect delay with jitter: `retry_delay` plus a uniformly random
    /// share of `reconnect_randomness`. Transport adapters use this so a
    /// restarted cluster does not reconnect in lockstep.
    pub fn jittered_reconnect_delay(&self) -> Duration {
        let jitter_ms = self.reconnect_randomness.as_millis() as u64;
        if jitter_ms == 0 {
            return self.retry_delay;
        }
        self.retry_delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
