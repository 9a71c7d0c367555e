//! Snapshot acceptance and convergence stages.

use crate::control::ClusterSnapshot;

/// Stages of the cluster-wide convergence protocol, advanced strictly
/// forward within one membership-change round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Joining,
    UpdatedSubs,
    UpdatedPubs,
    Active,
}

impl Stage {
    /// Wire name used in the composite `"<stage>:<peers json>"` string.
    pub fn as_str(self) -> &'static str {
        match self {
            // `joining` is internal; it is never reported to the server.
            Stage::Joining => "joining",
            Stage::UpdatedSubs => "updatedSubs",
            Stage::UpdatedPubs => "updatedPubs",
            Stage::Active => "active",
        }
    }
}

/// Monotonic, content-deduplicated holder of the latest accepted snapshot.
#[derive(Debug)]
pub struct SnapshotTracker {
    peers: Vec<String>,
    latest_time: i64,
    latest_json: String,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            latest_time: -1,
            latest_json: "[]".to_string(),
        }
    }

    /// Accept `snapshot` as the new topology iff its timestamp is strictly
    /// newer and its peer-list content differs from the held one.
    pub fn accept(&mut self, snapshot: &ClusterSnapshot) -> bool {
        let incoming_json = peers_json(&snapshot.server_instances);
        if snapshot.time > self.latest_time && incoming_json != self.latest_json {
            self.peers = snapshot.server_instances.clone();
            self.latest_time = snapshot.time;
            self.latest_json = incoming_json;
            return true;
        }
        false
    }

    /// Forget everything; used when (re)joining the cluster.
    pub fn reset(&mut self) {
        self.peers.clear();
        self.latest_time = -1;
        self.latest_json = "[]".to_string();
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Composite state string for this node's report of `stage` against
    /// the held peer list.
    pub fn state_string(&self, stage: Stage) -> String {
        format!("{}:{}", stage.as_str(), self.latest_json)
    }

    /// Whether a `clientStatesConverge` payload refers to `stage` over the
    /// exact peer list currently held.
    pub fn matches_converged_state(&self, stage: Stage, state: &str) -> bool {
        state == self.state_string(stage)
    }
}

impl Default for SnapshotTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON rendering of a peer list, the protocol's content-identity for
/// snapshots and composite state strings.
fn peers_json(peers: &[String]) -> String {
    // Serializing a string slice cannot fail.
    serde_json::to_string(peers).unwrap_or_else(|_| "[]".to_string())
}
