//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of the limiter state that peer nodes share.
//! Every node only ever writes its own key space; readers aggregate across
//! live nodes.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::MeshConfig;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl From<&MeshConfig> for ClusterConfig {
    fn from(mesh: &MeshConfig) -> Self {
        Self {
            node_id: mesh
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            listen_addr: mesh.listen_addr,
            advertise_addr: mesh.advertise_addr.unwrap_or(mesh.listen_addr),
            seed_nodes: mesh.seed_nodes.clone(),
            cluster_id: mesh.cluster_id.clone(),
            gossip_interval: Duration::from_millis(mesh.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// A piece of limiter state in a node's key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Fixed window counter: this node's contribution to the total.
    Counter(String),
    /// Sliding window log: timestamps this node admitted.
    Window(String),
}

impl StateKey {
    /// Convert to a chitchat key string.
    /// Format: "counter|{key}" or "window|{key}"
    pub fn to_chitchat_key(&self) -> String {
        match self {
            StateKey::Counter(key) => format!("counter|{}", key),
            StateKey::Window(key) => format!("window|{}", key),
        }
    }
}

/// Outcome of a sliding window admission across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshAdmission {
    pub admitted: bool,
    /// Entries inside the window across live nodes after the decision
    pub count: u64,
    /// Oldest entry inside the window, in Unix milliseconds
    pub oldest_ms: Option<i64>,
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
        })
    }

    #[cfg(test)]
    pub(crate) fn chitchat(&self) -> std::sync::Arc<tokio::sync::Mutex<Chitchat>> {
        self.handle.chitchat()
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Increment a counter and return the total across all nodes.
    ///
    /// This sets our local contribution for the counter key and reads
    /// all other nodes' contributions to compute the total.
    pub async fn increment_counter(&self, key: &str, amount: u64) -> u64 {
        let chitchat_key = StateKey::Counter(key.to_string()).to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: u64 = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + amount;
        chitchat
            .self_node_state()
            .set(&chitchat_key, new_local.to_string());

        debug!(
            key = %chitchat_key,
            local_value = new_local,
            "Incremented local counter"
        );

        sum_counter(&chitchat, &chitchat_key)
    }

    /// Get the total count for a key across all nodes.
    pub async fn get_count(&self, key: &str) -> u64 {
        let chitchat_key = StateKey::Counter(key.to_string()).to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        sum_counter(&chitchat, &chitchat_key)
    }

    /// Drop our timestamps older than `cutoff_ms`, then record `now_ms` if
    /// the live nodes together hold fewer than `limit` entries in the window.
    pub async fn window_admit(&self, key: &str, now_ms: i64, cutoff_ms: i64, limit: u64) -> MeshAdmission {
        let chitchat_key = StateKey::Window(key.to_string()).to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let mut own: Vec<i64> = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .map(parse_timestamps)
            .unwrap_or_default();
        own.retain(|ts| *ts >= cutoff_ms);

        let (peer_count, peer_oldest) = self.peer_window(&chitchat, &chitchat_key, now_ms, cutoff_ms);
        let total = own.len() as u64 + peer_count;
        let admitted = total < limit;
        if admitted {
            own.push(now_ms);
        }

        let oldest_ms = own.iter().copied().chain(peer_oldest).min();
        chitchat
            .self_node_state()
            .set(&chitchat_key, format_timestamps(&own));

        MeshAdmission {
            admitted,
            count: total + u64::from(admitted),
            oldest_ms,
        }
    }

    /// Entries inside `[cutoff_ms, now_ms]` across live nodes.
    pub async fn window_count(&self, key: &str, now_ms: i64, cutoff_ms: i64) -> u64 {
        let chitchat_key = StateKey::Window(key.to_string()).to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        chitchat
            .live_nodes()
            .filter_map(|id| chitchat.node_state(id))
            .filter_map(|state| state.get(&chitchat_key))
            .map(|value| {
                parse_timestamps(value)
                    .into_iter()
                    .filter(|ts| *ts >= cutoff_ms && *ts <= now_ms)
                    .count() as u64
            })
            .sum()
    }

    /// Remove keys from our own key space under a single lock.
    pub async fn delete_keys(&self, keys: &[StateKey]) {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let state = chitchat.self_node_state();
        for key in keys {
            state.delete(&key.to_chitchat_key());
        }
        debug!(keys = keys.len(), "Deleted expired state");
    }

    /// Window entries held by live peers, and the oldest of them.
    fn peer_window(
        &self,
        chitchat: &Chitchat,
        chitchat_key: &str,
        now_ms: i64,
        cutoff_ms: i64,
    ) -> (u64, Option<i64>) {
        let mut count = 0;
        let mut oldest = None;
        for id in chitchat.live_nodes().filter(|id| id.node_id != self.node_id) {
            let Some(value) = chitchat.node_state(id).and_then(|s| s.get(chitchat_key)) else {
                continue;
            };
            for ts in parse_timestamps(value) {
                if ts >= cutoff_ms && ts <= now_ms {
                    count += 1;
                    oldest = Some(oldest.map_or(ts, |o: i64| o.min(ts)));
                }
            }
        }
        (count, oldest)
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

/// Sum a counter across all live nodes, ourselves included.
fn sum_counter(chitchat: &Chitchat, key: &str) -> u64 {
    chitchat
        .live_nodes()
        .filter_map(|id| chitchat.node_state(id))
        .filter_map(|state| state.get(key))
        .filter_map(|value| value.parse::<u64>().ok())
        .sum()
}

/// Timestamps are gossiped as comma separated Unix milliseconds.
fn parse_timestamps(value: &str) -> Vec<i64> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn format_timestamps(timestamps: &[i64]) -> String {
    timestamps
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_state_keys() {
        assert_eq!(
            StateKey::Counter("fixed_window:10.0.0.1:42".to_string()).to_chitchat_key(),
            "counter|fixed_window:10.0.0.1:42"
        );
        assert_eq!(
            StateKey::Window("sliding_window:user".to_string()).to_chitchat_key(),
            "window|sliding_window:user"
        );
    }

    #[test]
    fn test_timestamp_encoding() {
        assert_eq!(format_timestamps(&[1, 20, 300]), "1,20,300");
        assert_eq!(parse_timestamps("1,20,300"), vec![1, 20, 300]);
        assert_eq!(parse_timestamps(""), Vec::<i64>::new());
        assert_eq!(parse_timestamps("5,garbage,7"), vec![5, 7]);
    }

    #[test]
    fn test_cluster_config_from_mesh() {
        let mesh = MeshConfig {
            node_id: None,
            listen_addr: ([127, 0, 0, 1], 7000).into(),
            advertise_addr: None,
            seed_nodes: vec!["10.0.0.2:7000".to_string()],
            cluster_id: "edge".to_string(),
            gossip_interval_ms: 250,
        };
        let config = ClusterConfig::from(&mesh);
        assert!(!config.node_id.is_empty());
        assert_eq!(config.advertise_addr, mesh.listen_addr);
        assert_eq!(config.gossip_interval, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let cluster = Cluster::start(test_config(17956)).await.unwrap();

        assert_eq!(cluster.node_id(), "test-node-17956");
        assert_eq!(cluster.live_node_count().await, 1); // Just ourselves

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_increment_counter() {
        let cluster = Cluster::start(test_config(17957)).await.unwrap();

        assert_eq!(cluster.increment_counter("fixed_window:a:1", 1).await, 1);
        assert_eq!(cluster.increment_counter("fixed_window:a:1", 1).await, 2);
        assert_eq!(cluster.get_count("fixed_window:a:1").await, 2);

        cluster
            .delete_keys(&[StateKey::Counter("fixed_window:a:1".to_string())])
            .await;
        assert_eq!(cluster.get_count("fixed_window:a:1").await, 0);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_window_admit() {
        let cluster = Cluster::start(test_config(17958)).await.unwrap();
        let key = "sliding_window:client";

        assert!(cluster.window_admit(key, 1_000, 0, 2).await.admitted);
        assert!(cluster.window_admit(key, 2_000, 0, 2).await.admitted);
        let denied = cluster.window_admit(key, 3_000, 0, 2).await;
        assert!(!denied.admitted);
        assert_eq!(denied.count, 2);
        assert_eq!(denied.oldest_ms, Some(1_000));

        // The first entry falls out of the window.
        let admission = cluster.window_admit(key, 4_000, 1_500, 2).await;
        assert!(admission.admitted);
        assert_eq!(cluster.window_count(key, 4_000, 1_500).await, 2);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes_share_windows() {
        let cluster1 = Cluster::start(test_config(17959)).await.unwrap();

        let mut config2 = test_config(17960);
        config2.seed_nodes = vec!["127.0.0.1:17959".to_string()];
        let cluster2 = Cluster::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        let key = "sliding_window:shared";
        assert!(cluster1.window_admit(key, 1_000, 0, 2).await.admitted);

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cluster2.window_admit(key, 1_100, 0, 2).await.admitted);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cluster1.window_admit(key, 1_200, 0, 2).await.admitted);
        assert_eq!(cluster2.window_count(key, 1_200, 0).await, 2);

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }
}
