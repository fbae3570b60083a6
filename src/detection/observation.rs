//! Request observations and detected attack patterns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier used when the caller could not extract one.
pub const ANONYMOUS: &str = "anonymous";

/// One inbound request as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Client identifier (IP address, user id, ...)
    #[serde(default)]
    pub identifier: String,
    /// Request path
    pub endpoint: String,
    /// HTTP method
    pub method: String,
    #[serde(default)]
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
    /// Outcome of the request, when already known
    #[serde(default = "default_success")]
    pub success: bool,
    /// Server-side handling time; zero when unknown
    #[serde(default, with = "secs_f64")]
    pub response_time: Duration,
}

fn default_success() -> bool {
    true
}

impl Observation {
    /// Create a successful observation with no user agent and unknown response time.
    pub fn new(
        identifier: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            user_agent: String::new(),
            timestamp,
            success: true,
            response_time: Duration::ZERO,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = response_time;
        self
    }
}

/// Normalize a raw client identifier.
///
/// Blank or control-character identifiers share the anonymous bucket.
pub fn normalize_identifier(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        ANONYMOUS
    } else {
        trimmed
    }
}

/// Kinds of attack the detector recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    BruteForce,
    CredentialStuffing,
    TimingAttack,
    Enumeration,
    VolumetricFlood,
    Scraping,
}

impl AttackType {
    /// Potential harm on a 1 to 10 scale.
    pub fn severity(&self) -> u8 {
        match self {
            AttackType::BruteForce => 7,
            AttackType::CredentialStuffing => 8,
            AttackType::TimingAttack => 6,
            AttackType::Enumeration => 5,
            AttackType::VolumetricFlood => 9,
            AttackType::Scraping => 4,
        }
    }
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AttackType::BruteForce => "brute_force",
            AttackType::CredentialStuffing => "credential_stuffing",
            AttackType::TimingAttack => "timing_attack",
            AttackType::Enumeration => "enumeration",
            AttackType::VolumetricFlood => "volumetric_flood",
            AttackType::Scraping => "scraping",
        };
        f.write_str(name)
    }
}

/// A classified attack, produced fresh by each analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackPattern {
    pub attack_type: AttackType,
    /// Detection certainty in `[0, 1]`
    pub confidence: f64,
    /// Potential harm in `[1, 10]`
    pub severity: u8,
    /// Measured quantities that triggered the rule
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

impl AttackPattern {
    pub fn new(
        attack_type: AttackType,
        confidence: f64,
        details: serde_json::Value,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            attack_type,
            confidence: confidence.clamp(0.0, 1.0),
            severity: attack_type.severity(),
            details,
            detected_at,
        }
    }

    /// Contribution of this pattern to an identifier's threat score.
    pub fn threat(&self) -> f64 {
        self.confidence * f64::from(self.severity)
    }
}

/// Serde adapter for durations written as fractional seconds.
pub(crate) mod secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
