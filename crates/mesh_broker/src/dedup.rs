//! Message de-duplication cache.
//!
//! During a topology migration the same packet can arrive once per active
//! mapping path. The cache records each packet id with a TTL deadline;
//! duplicates within the window are suppressed and refresh the deadline.
//! Memory is bounded only by TTL eviction, not by a capacity cap.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    deadlines: HashMap<String, Instant>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            deadlines: HashMap::new(),
        }
    }

    /// Record a sighting of `id`. Returns true when the id was already
    /// live (a duplicate); in all cases the TTL deadline is re-armed.
    pub fn observe(&mut self, id: &str) -> bool {
        let now = Instant::now();
        let deadline = now + self.ttl;
        match self.deadlines.insert(id.to_string(), deadline) {
            Some(previous) => previous > now,
            None => false,
        }
    }

    /// Drop entries whose deadline has passed. Liveness checks compare
    /// deadlines directly, so sweep cadence only bounds memory.
    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        self.deadlines.retain(|_, deadline| *deadline > now);
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_not_a_duplicate() {
        let mut cache = DedupCache::new(Duration::from_secs(10));
        assert!(!cache.observe("m1"));
        assert!(cache.observe("m1"));
        assert!(cache.observe("m1"));
        assert!(!cache.observe("m2"));
    }

    #[tokio::test]
    async fn expired_ids_are_treated_as_fresh() {
        let mut cache = DedupCache::new(Duration::from_millis(30));
        assert!(!cache.observe("m1"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Entry still present (no sweep ran) but its deadline has passed.
        assert!(!cache.observe("m1"));
    }

    #[tokio::test]
    async fn duplicates_refresh_the_ttl() {
        let mut cache = DedupCache::new(Duration::from_millis(80));
        assert!(!cache.observe("m1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Refresh at t=50; the deadline moves to t=130.
        assert!(cache.observe("m1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // t=100: still within the refreshed window.
        assert!(cache.observe("m1"));
    }

    #[tokio::test]
    async fn sweep_only_drops_expired_entries() {
        let mut cache = DedupCache::new(Duration::from_millis(40));
        cache.observe("old");
        tokio::time::sleep(Duration::from_millis(70)).await;
        cache.observe("fresh");
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.observe("fresh"));
    }

    #[tokio::test]
    async fn clear_forgets_everything() {
        let mut cache = DedupCache::new(Duration::from_secs(10));
        cache.observe("m1");
        cache.observe("m2");
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.observe("m1"));
    }
}
