//! Public entry point combining detection, adaptive limits and admission.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::algorithm::{self, Admission, Decision};
use super::backend::CounterStore;
use super::fallback::FallbackStore;
use super::local::LocalStore;
use crate::adaptive::AdaptiveLimitController;
use crate::clock::{delta, later, Clock, SystemClock};
use crate::config::RampartConfig;
use crate::detection::{normalize_identifier, AttackPattern, Observation};
use crate::error::Result;
use crate::events::{EventBus, SecurityEvent};

/// The answer to one [`RateLimitService::check`] call.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining_requests: u64,
    pub reset_time: DateTime<Utc>,
    /// Only set on denials; whole seconds on the wire
    #[serde(rename = "retry_after_secs", serialize_with = "serialize_retry_after")]
    pub retry_after: Option<Duration>,
    /// Effective limit the decision was made against
    pub limit: u64,
    pub attack_detected: bool,
    pub attack_patterns: Vec<AttackPattern>,
}

fn serialize_retry_after<S: Serializer>(
    value: &Option<Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

impl RateLimitResult {
    /// Conventional HTTP response headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining_requests.to_string()),
            ("X-RateLimit-Reset", self.reset_time.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after.as_secs().to_string()));
        }
        headers
    }
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    /// Identifiers whose observation history was dropped
    pub histories: usize,
    /// Identifiers whose adaptive state was dropped
    pub reputations: usize,
    /// Identifiers whose bucket state was dropped
    pub limiter_states: usize,
    /// Expired counter store keys
    pub counter_keys: usize,
}

/// Rate limiting service with attack detection and adaptive quotas.
///
/// The service is shared behind an `Arc` and safe to call concurrently.
/// `check` never fails: infrastructure problems resolve to admitting the
/// request, and every call produces a well-formed result.
pub struct RateLimitService {
    config: RampartConfig,
    clock: Arc<dyn Clock>,
    controller: AdaptiveLimitController,
    admission: Box<dyn Admission>,
    store: Arc<dyn CounterStore>,
    events: EventBus,
    /// Unix micros of the last cleanup pass
    last_cleanup: AtomicI64,
}

impl RateLimitService {
    /// Create a service using the system clock and in-process counters.
    pub fn new(config: RampartConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(SystemClock), None)
    }

    /// Create a service driven by `clock`, with in-process counters.
    pub fn with_clock(config: RampartConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_parts(config, clock, None)
    }

    /// Create a service from its parts.
    ///
    /// With a `primary` store, window counters go there first and fall back
    /// to in-process counters when it errors or exceeds the backend timeout.
    pub fn with_parts(
        config: RampartConfig,
        clock: Arc<dyn Clock>,
        primary: Option<Arc<dyn CounterStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let rl = &config.rate_limit;
        let events = EventBus::new();
        let local = LocalStore::with_retention(rl.window());
        let store: Arc<dyn CounterStore> = match primary {
            Some(primary) => Arc::new(FallbackStore::new(
                primary,
                local,
                config.backend.timeout(),
                events.clone(),
            )),
            None => Arc::new(local),
        };

        let admission = algorithm::build(rl.algorithm, rl.window(), store.clone());
        let controller = AdaptiveLimitController::new(&config);

        info!(
            algorithm = %rl.algorithm,
            window_secs = rl.window_secs,
            max_requests = rl.max_requests,
            backend = %store.name(),
            attack_detection = rl.enable_attack_detection,
            adaptive_limiting = rl.enable_adaptive_limiting,
            "Rate limit service initialized"
        );

        Ok(Self {
            last_cleanup: AtomicI64::new(clock.now().timestamp_micros()),
            config,
            clock,
            controller,
            admission,
            store,
            events,
        })
    }

    pub fn config(&self) -> &RampartConfig {
        &self.config
    }

    pub fn controller(&self) -> &AdaptiveLimitController {
        &self.controller
    }

    /// Receive the security events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Decide whether `identifier` may make the request described by
    /// `observation`.
    ///
    /// A request denied by a high-confidence pattern or by reputation never
    /// reaches the admission algorithm, so it consumes no quota. Its result
    /// reports nothing remaining until the block expires.
    pub async fn check(&self, identifier: &str, observation: &Observation) -> RateLimitResult {
        let identifier = normalize_identifier(identifier);
        let now = self.clock.now();
        self.maybe_cleanup(now).await;

        let rl = &self.config.rate_limit;
        let (limit, patterns) = match (rl.enable_attack_detection, rl.enable_adaptive_limiting) {
            (true, true) => self.controller.evaluate(identifier, observation),
            (true, false) => (
                self.controller.base_limit(),
                self.controller.detect(identifier, observation),
            ),
            (false, _) => (self.controller.base_limit(), Vec::new()),
        };

        for pattern in &patterns {
            self.events.publish(SecurityEvent::AttackPatternDetected {
                identifier: identifier.to_string(),
                pattern: pattern.clone(),
            });
        }

        let decision = match self.block_reason(identifier, &patterns) {
            Some(reason) => {
                let block = rl.block_duration();
                self.events.publish(SecurityEvent::IdentifierBlocked {
                    identifier: identifier.to_string(),
                    reason,
                    retry_after_secs: block.as_secs(),
                    at: now,
                });
                Decision {
                    allowed: false,
                    remaining: 0,
                    reset_time: later(now, delta(block)),
                    retry_after: Some(block),
                }
            }
            None => self.admission.admit(identifier, limit, now).await,
        };
        trace!(
            identifier = %identifier,
            allowed = decision.allowed,
            remaining = decision.remaining,
            limit = limit,
            "Admission decided"
        );

        RateLimitResult {
            allowed: decision.allowed,
            remaining_requests: decision.remaining,
            reset_time: decision.reset_time.max(now).max(observation.timestamp),
            retry_after: decision.retry_after,
            limit,
            attack_detected: !patterns.is_empty(),
            attack_patterns: patterns,
        }
    }

    /// Why the request must be denied regardless of quota, if it must.
    fn block_reason(&self, identifier: &str, patterns: &[AttackPattern]) -> Option<String> {
        let threshold = self.config.rate_limit.block_confidence;
        let strongest = patterns
            .iter()
            .filter(|p| p.confidence > threshold)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        if let Some(pattern) = strongest {
            return Some(format!(
                "{} detected with confidence {:.2}",
                pattern.attack_type, pattern.confidence
            ));
        }

        if self.config.rate_limit.enable_attack_detection && self.controller.is_blocked(identifier) {
            return Some(format!(
                "reputation {:.2} reached block threshold",
                self.controller.reputation(identifier)
            ));
        }
        None
    }

    /// Run a cleanup pass if the cleanup interval has elapsed. Only one
    /// caller wins the race for a given interval.
    async fn maybe_cleanup(&self, now: DateTime<Utc>) {
        let now_us = now.timestamp_micros();
        let interval_us = i64::try_from(self.config.rate_limit.cleanup_interval().as_micros())
            .unwrap_or(i64::MAX);
        let last = self.last_cleanup.load(Ordering::Acquire);

        if now_us.saturating_sub(last) < interval_us {
            return;
        }
        if self
            .last_cleanup
            .compare_exchange(last, now_us, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.cleanup(now).await;
        }
    }

    /// Prune stale histories, decay reputations, and drop expired limiter
    /// state and counters.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> CleanupStats {
        let stats = CleanupStats {
            histories: self.controller.detector().prune(now),
            reputations: self.controller.decay(now),
            limiter_states: self.admission.purge(now),
            counter_keys: self.store.purge_expired(now).await,
        };
        debug!(
            histories = stats.histories,
            reputations = stats.reputations,
            limiter_states = stats.limiter_states,
            counter_keys = stats.counter_keys,
            "Cleanup pass finished"
        );
        stats
    }

    /// Run the cleanup pass every cleanup interval on a background task.
    pub fn spawn_cleanup(self: &Arc<Self>) -> CleanupHandle {
        let service = Arc::clone(self);
        let period = self.config.rate_limit.cleanup_interval();
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = service.clock.now();
                        service.last_cleanup.store(now.timestamp_micros(), Ordering::Release);
                        service.cleanup(now).await;
                    }
                    _ = &mut stop_rx => break,
                }
            }
            debug!("Cleanup task stopped");
        });

        info!(interval_secs = period.as_secs(), "Started background cleanup");
        CleanupHandle { stop: stop_tx, task }
    }
}

/// Handle to the background cleanup task.
pub struct CleanupHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Stop the task and wait for it to finish its current pass.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            debug!(error = %e, "Cleanup task ended abnormally");
        }
    }
}
