//! Configuration management for Rampart.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RampartError, Result};

/// Environment variable prefix for overrides, e.g. `RAMPART__RATE_LIMIT__MAX_REQUESTS=50`.
const ENV_PREFIX: &str = "RAMPART";

/// One year.
const MAX_WINDOW_SECS: u64 = 31_536_000;

/// Main configuration for the Rampart engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RampartConfig {
    /// Admission and adaptive limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Attack detection thresholds
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Counter backend configuration
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Admission algorithm used by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    #[default]
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        };
        f.write_str(name)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admission algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Window size in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Base number of requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Run the attack pattern detector on every check
    #[serde(default = "default_true")]
    pub enable_attack_detection: bool,

    /// Shrink quotas in response to detected patterns
    #[serde(default = "default_true")]
    pub enable_adaptive_limiting: bool,

    /// Patterns above this confidence deny the request outright
    #[serde(default = "default_block_confidence")]
    pub block_confidence: f64,

    /// How long a blocked identifier is told to wait, in seconds
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,

    /// Reputation at which an identifier is blocked regardless of quota
    #[serde(default = "default_reputation_block_threshold")]
    pub reputation_block_threshold: f64,

    /// Cleanup interval in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Lower bound for the adaptive limit
    #[serde(default = "default_min_limit")]
    pub min_limit: u64,

    /// Upper bound for the adaptive limit
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            enable_attack_detection: true,
            enable_adaptive_limiting: true,
            block_confidence: default_block_confidence(),
            block_duration_secs: default_block_duration_secs(),
            reputation_block_threshold: default_reputation_block_threshold(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
        }
    }
}

impl RateLimitConfig {
    /// Window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Cleanup interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Block duration as a duration.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> u64 {
    100
}

fn default_block_confidence() -> f64 {
    0.8
}

fn default_block_duration_secs() -> u64 {
    300
}

fn default_reputation_block_threshold() -> f64 {
    8.0
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_min_limit() -> u64 {
    10
}

fn default_max_limit() -> u64 {
    10_000
}

/// Thresholds for the attack pattern detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Observations kept per identifier
    pub history_capacity: usize,
    /// Most recent observations considered by sample-based rules
    pub sample_size: usize,
    /// History older than this is dropped by the cleanup pass, in seconds
    pub retention_secs: u64,
    /// Hard cap on identifiers with a history
    pub max_tracked_identifiers: usize,

    pub brute_force_window_secs: u64,
    /// Failures must exceed this count
    pub brute_force_min_failures: usize,
    pub brute_force_failure_rate: f64,

    pub stuffing_min_requests: usize,
    pub stuffing_min_auth_requests: usize,
    pub stuffing_min_user_agents: usize,
    /// Path fragments that mark an authentication endpoint
    pub auth_endpoint_markers: Vec<String>,

    pub timing_min_samples: usize,
    pub timing_min_mean_secs: f64,
    /// Maximum std/mean ratio of response times
    pub timing_max_relative_std: f64,

    pub enumeration_min_requests: usize,
    pub enumeration_unique_ratio: f64,

    pub flood_window_secs: u64,
    /// Observations in the flood window must exceed this count
    pub flood_max_requests: usize,

    pub scraping_sample: usize,
    /// Maximum std/mean ratio of inter-arrival intervals
    pub scraping_max_relative_std: f64,
    pub scraping_max_mean_interval_secs: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            sample_size: 100,
            retention_secs: 3600,
            max_tracked_identifiers: 100_000,
            brute_force_window_secs: 60,
            brute_force_min_failures: 5,
            brute_force_failure_rate: 0.7,
            stuffing_min_requests: 20,
            stuffing_min_auth_requests: 10,
            stuffing_min_user_agents: 3,
            auth_endpoint_markers: vec!["auth".to_string(), "login".to_string()],
            timing_min_samples: 15,
            timing_min_mean_secs: 0.1,
            timing_max_relative_std: 0.1,
            enumeration_min_requests: 20,
            enumeration_unique_ratio: 0.7,
            flood_window_secs: 10,
            flood_max_requests: 30,
            scraping_sample: 20,
            scraping_max_relative_std: 0.2,
            scraping_max_mean_interval_secs: 10.0,
        }
    }
}

/// Which counter store backs the fixed and sliding window algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process counters only
    #[default]
    Local,
    /// Gossip mesh shared with peer nodes, local counters as fallback
    Mesh,
}

/// Counter backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Upper bound on a single distributed backend call, in milliseconds
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,

    /// Gossip mesh settings, required when `kind` is `mesh`
    #[serde(default)]
    pub mesh: Option<MeshConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            timeout_ms: default_backend_timeout_ms(),
            mesh: None,
        }
    }
}

impl BackendConfig {
    /// Backend timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_backend_timeout_ms() -> u64 {
    50
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Unique node identifier, generated when absent
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers, defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes used to join the mesh
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers that share this id
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "rampart".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

impl RampartConfig {
    /// Load configuration from a file, layered with `RAMPART__*` environment overrides.
    ///
    /// The format is picked from the file extension (YAML, TOML or JSON).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: RampartConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RampartConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RampartError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if rl.window_secs == 0 || rl.window_secs > MAX_WINDOW_SECS {
            return Err(invalid("rate_limit.window_secs must be between 1 and 31536000"));
        }
        if rl.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests must be greater than zero"));
        }
        if rl.min_limit == 0 {
            return Err(invalid("rate_limit.min_limit must be greater than zero"));
        }
        if rl.min_limit > rl.max_limit {
            return Err(invalid("rate_limit.min_limit must not exceed rate_limit.max_limit"));
        }
        if rl.max_requests < rl.min_limit || rl.max_requests > rl.max_limit {
            return Err(RampartError::Config(format!(
                "rate_limit.max_requests ({}) must lie within [{}, {}]",
                rl.max_requests, rl.min_limit, rl.max_limit
            )));
        }
        if !(rl.block_confidence > 0.0 && rl.block_confidence <= 1.0) {
            return Err(invalid("rate_limit.block_confidence must be in (0, 1]"));
        }
        if !(rl.reputation_block_threshold > 0.0) {
            return Err(invalid("rate_limit.reputation_block_threshold must be positive"));
        }
        if rl.cleanup_interval_secs == 0 || rl.cleanup_interval_secs > MAX_WINDOW_SECS {
            return Err(invalid("rate_limit.cleanup_interval_secs must be between 1 and 31536000"));
        }
        if rl.block_duration_secs > MAX_WINDOW_SECS {
            return Err(invalid("rate_limit.block_duration_secs must not exceed 31536000"));
        }

        let det = &self.detection;
        if det.history_capacity == 0 || det.sample_size == 0 {
            return Err(invalid("detection.history_capacity and sample_size must be greater than zero"));
        }
        if det.max_tracked_identifiers == 0 {
            return Err(invalid("detection.max_tracked_identifiers must be greater than zero"));
        }
        for (name, secs) in [
            ("detection.brute_force_window_secs", det.brute_force_window_secs),
            ("detection.flood_window_secs", det.flood_window_secs),
            ("detection.retention_secs", det.retention_secs),
        ] {
            if secs == 0 || secs > MAX_WINDOW_SECS {
                return Err(RampartError::Config(format!(
                    "{} must be between 1 and {}",
                    name, MAX_WINDOW_SECS
                )));
            }
        }
        if det.scraping_sample < 3 {
            return Err(invalid("detection.scraping_sample must be at least 3"));
        }

        if self.backend.timeout_ms == 0 {
            return Err(invalid("backend.timeout_ms must be greater than zero"));
        }
        if self.backend.kind == BackendKind::Mesh && self.backend.mesh.is_none() {
            return Err(invalid("backend.mesh must be set when backend.kind is mesh"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> RampartError {
    RampartError::Config(msg.to_string())
}
