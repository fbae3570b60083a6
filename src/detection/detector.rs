//! Online attack pattern detection over per-identifier request history.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, trace};

use super::observation::{AttackPattern, AttackType, Observation};
use super::stats;
use crate::clock::{self, earlier, epoch_secs};
use crate::config::DetectionConfig;
use crate::error::Result;

type History = VecDeque<Arc<Observation>>;

/// A detection rule over a chronological snapshot of recent observations.
type Rule = fn(&AttackPatternDetector, &Snapshot<'_>) -> Result<Option<AttackPattern>>;

const RULES: [(AttackType, Rule); 6] = [
    (AttackType::BruteForce, AttackPatternDetector::brute_force),
    (AttackType::CredentialStuffing, AttackPatternDetector::credential_stuffing),
    (AttackType::TimingAttack, AttackPatternDetector::timing_attack),
    (AttackType::Enumeration, AttackPatternDetector::enumeration),
    (AttackType::VolumetricFlood, AttackPatternDetector::volumetric_flood),
    (AttackType::Scraping, AttackPatternDetector::scraping),
];

/// Recent observations for one identifier, oldest first, ending with the
/// observation being analyzed.
struct Snapshot<'a> {
    observations: &'a [Arc<Observation>],
    now: DateTime<Utc>,
}

impl<'a> Snapshot<'a> {
    /// The most recent `n` observations.
    fn tail(&self, n: usize) -> &'a [Arc<Observation>] {
        let start = self.observations.len().saturating_sub(n);
        &self.observations[start..]
    }

    /// Observations no older than `secs` before the analyzed one.
    fn within(&self, secs: u64) -> impl Iterator<Item = &'a Arc<Observation>> + 'a {
        let cutoff = earlier(self.now, clock::secs(secs));
        let observations = self.observations;
        observations.iter().filter(move |o| o.timestamp >= cutoff)
    }
}

/// Classifies each identifier's recent behavior into attack patterns.
///
/// Histories live in a sharded map; an analysis holds its identifier's shard
/// only while appending and copying out the recent tail, then evaluates the
/// rules without any lock.
pub struct AttackPatternDetector {
    histories: DashMap<String, History>,
    config: DetectionConfig,
}

impl AttackPatternDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            histories: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Record `observation` for `identifier` and return every pattern its
    /// recent behavior matches.
    pub fn analyze(&self, identifier: &str, observation: &Observation) -> Vec<AttackPattern> {
        let recent = self.record(identifier, observation);
        let snapshot = Snapshot {
            observations: &recent,
            now: observation.timestamp,
        };

        let mut patterns = Vec::new();
        for (attack_type, rule) in RULES {
            match rule(self, &snapshot) {
                Ok(Some(pattern)) => patterns.push(pattern),
                Ok(None) => {}
                Err(e) => debug!(
                    identifier = %identifier,
                    rule = %attack_type,
                    error = %e,
                    "Detection rule failed, treating as no match"
                ),
            }
        }

        trace!(
            identifier = %identifier,
            history = recent.len(),
            patterns = patterns.len(),
            "Analyzed observation"
        );
        patterns
    }

    /// Record `observation` and hold the map to the identifier cap.
    fn record(&self, identifier: &str, observation: &Observation) -> Vec<Arc<Observation>> {
        let recent = self.append(identifier, observation);

        let cap = self.config.max_tracked_identifiers;
        let tracked = self.histories.len();
        if tracked > cap {
            // Overshoot by a sixteenth of the cap to batch evictions.
            let evicted = self.evict_least_recent(tracked - cap + cap / 16);
            debug!(evicted = evicted, "Identifier cap reached, evicted least recently seen");
        }
        recent
    }

    /// Append to the bounded history and copy out the part the rules look at.
    fn append(&self, identifier: &str, observation: &Observation) -> Vec<Arc<Observation>> {
        let mut history = self.histories.entry(identifier.to_string()).or_default();
        while history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(Arc::new(observation.clone()));

        let horizon = self.config.brute_force_window_secs.max(self.config.flood_window_secs);
        let cutoff = earlier(observation.timestamp, clock::secs(horizon));
        let keep = self.config.sample_size.max(self.config.scraping_sample);

        let mut recent: Vec<Arc<Observation>> = history
            .iter()
            .rev()
            .enumerate()
            .take_while(|(i, o)| *i < keep || o.timestamp >= cutoff)
            .map(|(_, o)| Arc::clone(o))
            .collect();
        recent.reverse();
        recent
    }

    fn brute_force(&self, s: &Snapshot<'_>) -> Result<Option<AttackPattern>> {
        let cfg = &self.config;
        let (total, failures) = s
            .within(cfg.brute_force_window_secs)
            .fold((0usize, 0usize), |(t, f), o| (t + 1, f + usize::from(!o.success)));

        if failures <= cfg.brute_force_min_failures {
            return Ok(None);
        }
        let failure_rate = failures as f64 / total as f64;
        if failure_rate <= cfg.brute_force_failure_rate {
            return Ok(None);
        }

        Ok(Some(AttackPattern::new(
            AttackType::BruteForce,
            failure_rate.min(1.0),
            json!({
                "failures": failures,
                "total": total,
                "failure_rate": failure_rate,
                "window_secs": cfg.brute_force_window_secs,
            }),
            s.now,
        )))
    }

    fn credential_stuffing(&self, s: &Snapshot<'_>) -> Result<Option<AttackPattern>> {
        let cfg = &self.config;
        let sample = s.tail(cfg.sample_size);
        if sample.len() < cfg.stuffing_min_requests {
            return Ok(None);
        }

        let auth: Vec<&Arc<Observation>> = sample
            .iter()
            .filter(|o| self.is_auth_endpoint(&o.endpoint))
            .collect();
        if auth.len() < cfg.stuffing_min_auth_requests {
            return Ok(None);
        }

        let user_agents: HashSet<&str> = auth.iter().map(|o| o.user_agent.as_str()).collect();
        if user_agents.len() < cfg.stuffing_min_user_agents {
            return Ok(None);
        }

        let confidence = (auth.len() as f64 / cfg.stuffing_min_requests as f64).min(1.0);
        Ok(Some(AttackPattern::new(
            AttackType::CredentialStuffing,
            confidence,
            json!({
                "auth_requests": auth.len(),
                "distinct_user_agents": user_agents.len(),
                "sample": sample.len(),
            }),
            s.now,
        )))
    }

    fn timing_attack(&self, s: &Snapshot<'_>) -> Result<Option<AttackPattern>> {
        let cfg = &self.config;
        let times: Vec<f64> = s
            .tail(cfg.sample_size)
            .iter()
            .map(|o| o.response_time.as_secs_f64())
            .filter(|t| *t > 0.0)
            .collect();
        if times.len() < cfg.timing_min_samples {
            return Ok(None);
        }

        let mean = stats::mean(&times)?;
        if mean <= cfg.timing_min_mean_secs {
            return Ok(None);
        }
        let std = stats::std_dev(&times)?;
        if std >= cfg.timing_max_relative_std * mean {
            return Ok(None);
        }

        Ok(Some(AttackPattern::new(
            AttackType::TimingAttack,
            1.0 - std / mean,
            json!({
                "samples": times.len(),
                "mean_secs": mean,
                "std_secs": std,
            }),
            s.now,
        )))
    }

    fn enumeration(&self, s: &Snapshot<'_>) -> Result<Option<AttackPattern>> {
        let cfg = &self.config;
        let sample = s.tail(cfg.sample_size);
        if sample.len() < cfg.enumeration_min_requests {
            return Ok(None);
        }

        let unique: HashSet<&str> = sample.iter().map(|o| o.endpoint.as_str()).collect();
        let ratio = unique.len() as f64 / sample.len() as f64;
        if ratio <= cfg.enumeration_unique_ratio {
            return Ok(None);
        }

        Ok(Some(AttackPattern::new(
            AttackType::Enumeration,
            ratio,
            json!({
                "unique_endpoints": unique.len(),
                "sample": sample.len(),
                "unique_ratio": ratio,
            }),
            s.now,
        )))
    }

    fn volumetric_flood(&self, s: &Snapshot<'_>) -> Result<Option<AttackPattern>> {
        let cfg = &self.config;
        let count = s.within(cfg.flood_window_secs).count();
        if count <= cfg.flood_max_requests {
            return Ok(None);
        }

        let rate = count as f64 / cfg.flood_window_secs as f64;
        Ok(Some(AttackPattern::new(
            AttackType::VolumetricFlood,
            (rate / 10.0).min(1.0),
            json!({
                "requests": count,
                "window_secs": cfg.flood_window_secs,
                "rate_per_sec": rate,
            }),
            s.now,
        )))
    }

    fn scraping(&self, s: &Snapshot<'_>) -> Result<Option<AttackPattern>> {
        let cfg = &self.config;
        let sample = s.tail(cfg.scraping_sample);
        if sample.len() < cfg.scraping_sample {
            return Ok(None);
        }

        let user_agents: HashSet<&str> = sample.iter().map(|o| o.user_agent.as_str()).collect();
        let methods: HashSet<&str> = sample.iter().map(|o| o.method.as_str()).collect();
        if user_agents.len() != 1 || methods.len() != 1 {
            return Ok(None);
        }

        let mut times: Vec<f64> = sample
            .iter()
            .map(|o| epoch_secs(o.timestamp))
            .collect();
        times.sort_by(f64::total_cmp);
        let gaps = stats::intervals(&times);

        let mean = stats::mean(&gaps)?;
        if mean <= 0.0 || mean >= cfg.scraping_max_mean_interval_secs {
            return Ok(None);
        }
        let std = stats::std_dev(&gaps)?;
        if std >= cfg.scraping_max_relative_std * mean {
            return Ok(None);
        }

        Ok(Some(AttackPattern::new(
            AttackType::Scraping,
            1.0 - std / mean,
            json!({
                "mean_interval_secs": mean,
                "std_interval_secs": std,
                "user_agent": sample[0].user_agent,
                "method": sample[0].method,
            }),
            s.now,
        )))
    }

    fn is_auth_endpoint(&self, endpoint: &str) -> bool {
        let endpoint = endpoint.to_ascii_lowercase();
        self.config
            .auth_endpoint_markers
            .iter()
            .any(|marker| endpoint.contains(marker.as_str()))
    }

    /// Drop observations older than the retention window. Returns how many
    /// identifiers were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = earlier(now, clock::secs(self.config.retention_secs));
        let before = self.histories.len();

        self.histories.retain(|_, history| {
            while history.front().is_some_and(|o| o.timestamp < cutoff) {
                history.pop_front();
            }
            !history.is_empty()
        });

        before.saturating_sub(self.histories.len())
    }

    /// Remove the `count` identifiers whose latest observation is oldest.
    fn evict_least_recent(&self, count: usize) -> usize {
        let mut last_seen: Vec<(String, DateTime<Utc>)> = self
            .histories
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .back()
                    .map(|o| (entry.key().clone(), o.timestamp))
            })
            .collect();
        last_seen.sort_by_key(|(_, ts)| *ts);
        last_seen
            .into_iter()
            .take(count)
            .filter(|(identifier, _)| self.histories.remove(identifier).is_some())
            .count()
    }

    /// Number of observations held for `identifier`.
    pub fn history_len(&self, identifier: &str) -> usize {
        self.histories.get(identifier).map_or(0, |h| h.len())
    }

    /// Number of identifiers with a history.
    pub fn tracked_identifiers(&self) -> usize {
        self.histories.len()
    }
}
