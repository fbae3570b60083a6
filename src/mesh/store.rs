//! Counter store backed by the gossip mesh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::cluster::{Cluster, StateKey};
use crate::clock::{delta, earlier, later};
use crate::error::Result;
use crate::ratelimit::{CounterStore, WindowAdmission};

/// Shares fixed and sliding window state with peer nodes.
///
/// Gossip converges eventually, so two nodes admitting at the same instant
/// may both see room for one more request. Expiry is tracked per node: each
/// node deletes its own contributions once they can no longer matter.
pub struct MeshCounterStore {
    cluster: Arc<Cluster>,
    expiries: DashMap<StateKey, DateTime<Utc>>,
}

impl MeshCounterStore {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            expiries: DashMap::new(),
        }
    }

    /// Push the expiry of `key` out to `until`. Returns whether a previous
    /// expiry had already passed.
    fn touch(&self, key: StateKey, now: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        let mut expiry = self.expiries.entry(key).or_insert(until);
        let expired = now >= *expiry;
        if expired || until > *expiry {
            *expiry = until;
        }
        expired
    }
}

#[async_trait]
impl CounterStore for MeshCounterStore {
    fn name(&self) -> &str {
        "mesh"
    }

    async fn incr_with_expiry(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<u64> {
        let state_key = StateKey::Counter(key.to_string());
        let expires_at = later(now, delta(ttl));

        let mut expiry = self.expiries.entry(state_key.clone()).or_insert(expires_at);
        let expired = now >= *expiry;
        if expired {
            *expiry = expires_at;
        }
        drop(expiry);

        if expired {
            self.cluster.delete_keys(std::slice::from_ref(&state_key)).await;
        }
        Ok(self.cluster.increment_counter(key, 1).await)
    }

    async fn window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<WindowAdmission> {
        let cutoff = earlier(now, delta(window));
        self.touch(StateKey::Window(key.to_string()), now, later(now, delta(window)));

        let admission = self
            .cluster
            .window_admit(key, now.timestamp_millis(), cutoff.timestamp_millis(), limit)
            .await;

        Ok(WindowAdmission {
            admitted: admission.admitted,
            count: admission.count,
            oldest: admission.oldest_ms.and_then(DateTime::from_timestamp_millis),
        })
    }

    async fn window_count(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<u64> {
        let cutoff = earlier(now, delta(window));
        Ok(self
            .cluster
            .window_count(key, now.timestamp_millis(), cutoff.timestamp_millis())
            .await)
    }

    /// Keys stay tracked until their deletion has gone through, so a purge
    /// cancelled midway leaves them for the next pass.
    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<StateKey> = self
            .expiries
            .iter()
            .filter(|entry| now >= *entry.value())
            .map(|entry| entry.key().clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        self.cluster.delete_keys(&expired).await;

        let removed = expired
            .iter()
            .filter(|key| self.expiries.remove_if(*key, |_, expiry| now >= *expiry).is_some())
            .count();
        debug!(removed = removed, "Purged expired mesh state");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SimulatedClock};
    use crate::mesh::ClusterConfig;
    use std::net::SocketAddr;

    async fn store(port: u16) -> MeshCounterStore {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let cluster = Cluster::start(ClusterConfig {
            node_id: format!("store-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "store-test".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        })
        .await
        .unwrap();
        MeshCounterStore::new(Arc::new(cluster))
    }

    #[tokio::test]
    async fn test_counter_restarts_after_expiry() {
        let store = store(17961).await;
        let clock = SimulatedClock::at_secs(1_000);
        let ttl = Duration::from_secs(10);

        assert_eq!(store.incr_with_expiry("k", clock.now(), ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("k", clock.now(), ttl).await.unwrap(), 2);

        clock.advance(ttl);
        assert_eq!(store.incr_with_expiry("k", clock.now(), ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_admission_and_purge() {
        let store = store(17962).await;
        let clock = SimulatedClock::at_secs(1_000);
        let window = Duration::from_secs(60);

        assert!(store.window_admit("w", clock.now(), window, 1).await.unwrap().admitted);
        let denied = store.window_admit("w", clock.now(), window, 1).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.oldest, Some(clock.now()));
        assert_eq!(store.window_count("w", clock.now(), window).await.unwrap(), 1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.purge_expired(clock.now()).await, 1);
        assert_eq!(store.window_count("w", clock.now(), window).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_purge_keeps_keys_tracked() {
        let store = store(17963).await;
        let clock = SimulatedClock::at_secs(1_000);
        let window = Duration::from_secs(60);

        assert!(store.window_admit("w", clock.now(), window, 5).await.unwrap().admitted);
        clock.advance(Duration::from_secs(61));

        let chitchat = store.cluster.chitchat();
        let guard = chitchat.lock().await;
        let purge =
            tokio::time::timeout(Duration::from_millis(20), store.purge_expired(clock.now())).await;
        assert!(purge.is_err());
        drop(guard);

        assert_eq!(store.purge_expired(clock.now()).await, 1);
    }
}
