//! Adaptive quota control driven by detected attack patterns.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::clock::{self, earlier};
use crate::config::RampartConfig;
use crate::detection::{AttackPattern, AttackPatternDetector, Observation};

/// Reputation gained per unit of threat.
const REPUTATION_GAIN: f64 = 0.1;
/// Reputation never exceeds this.
const MAX_REPUTATION: f64 = 10.0;
/// Multiplicative decay applied per tick without detections.
const REPUTATION_DECAY: f64 = 0.99;
/// Reputations below this are treated as clean.
const REPUTATION_FLOOR: f64 = 0.01;

#[derive(Debug, Clone)]
struct IdentifierState {
    effective_limit: u64,
    reputation: f64,
    last_seen: DateTime<Utc>,
}

impl IdentifierState {
    fn decay(&mut self) {
        self.reputation *= REPUTATION_DECAY;
        if self.reputation < REPUTATION_FLOOR {
            self.reputation = 0.0;
        }
    }
}

/// Computes the current quota of each identifier and tracks its reputation.
///
/// Identifiers with no detection history carry no state: their limit is the
/// base limit and their reputation is zero.
pub struct AdaptiveLimitController {
    detector: AttackPatternDetector,
    states: DashMap<String, IdentifierState>,
    base_limit: u64,
    min_limit: u64,
    max_limit: u64,
    block_threshold: f64,
    retention: TimeDelta,
}

impl AdaptiveLimitController {
    pub fn new(config: &RampartConfig) -> Self {
        let rl = &config.rate_limit;
        Self {
            detector: AttackPatternDetector::new(config.detection.clone()),
            states: DashMap::new(),
            base_limit: rl.max_requests,
            min_limit: rl.min_limit,
            max_limit: rl.max_limit,
            block_threshold: rl.reputation_block_threshold,
            retention: clock::secs(config.detection.retention_secs),
        }
    }

    pub fn detector(&self) -> &AttackPatternDetector {
        &self.detector
    }

    pub fn base_limit(&self) -> u64 {
        self.base_limit
    }

    /// Analyze `observation` and return the identifier's effective limit
    /// together with the patterns that fired.
    ///
    /// Without detections the limit recovers by one request per call, up to
    /// the base limit. With detections it shrinks in proportion to the total
    /// threat, never below the minimum limit.
    pub fn evaluate(&self, identifier: &str, observation: &Observation) -> (u64, Vec<AttackPattern>) {
        let patterns = self.detector.analyze(identifier, observation);

        if patterns.is_empty() {
            let Some(mut state) = self.states.get_mut(identifier) else {
                return (self.base_limit, patterns);
            };
            state.effective_limit = (state.effective_limit + 1).min(self.base_limit);
            state.decay();
            state.last_seen = state.last_seen.max(observation.timestamp);
            return (state.effective_limit, patterns);
        }

        let threat: f64 = patterns.iter().map(AttackPattern::threat).sum();
        let reduction = (1.0 - threat / 100.0).clamp(0.0, 1.0);
        let reduced = (self.base_limit as f64 * reduction).floor() as u64;
        let effective_limit = reduced.clamp(self.min_limit, self.max_limit);

        let mut state = self
            .states
            .entry(identifier.to_string())
            .or_insert_with(|| IdentifierState {
                effective_limit: self.base_limit,
                reputation: 0.0,
                last_seen: observation.timestamp,
            });
        state.effective_limit = effective_limit;
        state.reputation = (state.reputation + threat * REPUTATION_GAIN).min(MAX_REPUTATION);
        state.last_seen = state.last_seen.max(observation.timestamp);

        debug!(
            identifier = %identifier,
            threat = threat,
            effective_limit = effective_limit,
            reputation = state.reputation,
            "Reduced limit after attack detection"
        );
        (effective_limit, patterns)
    }

    /// Run the detector without touching quota or reputation.
    pub fn detect(&self, identifier: &str, observation: &Observation) -> Vec<AttackPattern> {
        self.detector.analyze(identifier, observation)
    }

    /// Current reputation, zero for unknown identifiers.
    pub fn reputation(&self, identifier: &str) -> f64 {
        self.states.get(identifier).map_or(0.0, |s| s.reputation)
    }

    /// Current effective limit, the base limit for unknown identifiers.
    pub fn effective_limit(&self, identifier: &str) -> u64 {
        self.states
            .get(identifier)
            .map_or(self.base_limit, |s| s.effective_limit)
    }

    /// Whether the identifier's reputation alone warrants blocking it.
    pub fn is_blocked(&self, identifier: &str) -> bool {
        self.reputation(identifier) >= self.block_threshold
    }

    /// One decay tick for every tracked identifier.
    ///
    /// Entries that are clean again, or idle past the retention window, are
    /// dropped. Returns how many were removed.
    pub fn decay(&self, now: DateTime<Utc>) -> usize {
        let cutoff = earlier(now, self.retention);
        let before = self.states.len();
        self.states.retain(|_, state| {
            state.decay();
            let dirty = state.reputation > 0.0 || state.effective_limit < self.base_limit;
            dirty && state.last_seen >= cutoff
        });
        before.saturating_sub(self.states.len())
    }

    /// Number of identifiers with adaptive state.
    pub fn tracked_identifiers(&self) -> usize {
        self.states.len()
    }
}
