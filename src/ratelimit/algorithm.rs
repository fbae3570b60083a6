//! Admission algorithm abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::backend::CounterStore;
use super::fixed_window::FixedWindow;
use super::leaky_bucket::LeakyBucket;
use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;
use crate::config::Algorithm;

/// Result of one admission decision, before attack overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests still available to the identifier
    pub remaining: u64,
    /// When the quota is next replenished
    pub reset_time: DateTime<Utc>,
    /// Set on denials only
    pub retry_after: Option<Duration>,
}

/// A rate limiting algorithm.
///
/// Each implementation owns its per-identifier state and updates it
/// atomically with the decision it returns. Implementations never fail:
/// storage problems are resolved by admitting the request.
#[async_trait]
pub trait Admission: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Decide whether `identifier` may make one more request under `limit`.
    async fn admit(&self, identifier: &str, limit: u64, now: DateTime<Utc>) -> Decision;

    /// Drop state that can no longer affect a decision. Returns the number of
    /// identifiers removed.
    fn purge(&self, _now: DateTime<Utc>) -> usize {
        0
    }
}

/// Build the configured algorithm.
///
/// Only the window algorithms keep their counters in `store`; the buckets are
/// always process-local.
pub fn build(
    algorithm: Algorithm,
    window: Duration,
    store: Arc<dyn CounterStore>,
) -> Box<dyn Admission> {
    match algorithm {
        Algorithm::FixedWindow => Box::new(FixedWindow::new(window, store)),
        Algorithm::SlidingWindow => Box::new(SlidingWindow::new(window, store)),
        Algorithm::TokenBucket => Box::new(TokenBucket::new(window)),
        Algorithm::LeakyBucket => Box::new(LeakyBucket::new(window)),
    }
}

/// Units per second for a quota of `limit` spread over `window`.
pub(crate) fn rate_per_sec(limit: u64, window: Duration) -> f64 {
    limit as f64 / window.as_secs_f64().max(f64::MIN_POSITIVE)
}
