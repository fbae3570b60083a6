//! Token bucket.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::algorithm::{rate_per_sec, Admission, Decision};
use crate::clock::{delta, earlier, epoch_secs, later, retry_secs};
use crate::config::Algorithm;

/// Slack for float accumulation when comparing token counts.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Refills `limit` tokens per window at a constant rate, holding at most
/// `limit`. A request spends one token. New identifiers start with a full
/// bucket, so bursts up to `limit` are admitted.
pub struct TokenBucket {
    window: Duration,
    buckets: DashMap<String, Bucket>,
}

impl TokenBucket {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: DashMap::new(),
        }
    }

    /// Tokens currently held by `identifier`, without refilling.
    pub fn tokens(&self, identifier: &str) -> Option<f64> {
        self.buckets.get(identifier).map(|bucket| bucket.tokens)
    }

    fn take(&self, identifier: &str, limit: u64, now: DateTime<Utc>) -> Decision {
        let capacity = limit as f64;
        let rate = rate_per_sec(limit, self.window);

        let mut bucket = self
            .buckets
            .entry(identifier.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = (epoch_secs(now) - epoch_secs(bucket.last_refill)).max(0.0);
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = bucket.last_refill.max(now);

        let allowed = bucket.tokens >= 1.0 - EPSILON;
        if allowed {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        }
        let tokens = bucket.tokens;
        drop(bucket);

        trace!(identifier = %identifier, tokens = tokens, limit = limit, "Token bucket admission");

        let horizon = self.window.as_secs_f64();
        let until_full = Duration::from_secs_f64(((capacity - tokens).max(0.0) / rate).min(horizon));
        let retry_after = if allowed {
            None
        } else {
            debug!(identifier = %identifier, limit = limit, "Rate limit exceeded");
            let until_token = Duration::from_secs_f64(((1.0 - tokens).max(0.0) / rate).min(horizon));
            Some(retry_secs(now, later(now, delta(until_token))))
        };

        Decision {
            allowed,
            remaining: (tokens + EPSILON).floor() as u64,
            reset_time: later(now, delta(until_full)),
            retry_after,
        }
    }
}

#[async_trait]
impl Admission for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn admit(&self, identifier: &str, limit: u64, now: DateTime<Utc>) -> Decision {
        self.take(identifier, limit, now)
    }

    /// A bucket idle for a whole window is full again, which is the same as
    /// having no state.
    fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        let cutoff = earlier(now, delta(self.window));
        self.buckets.retain(|_, bucket| bucket.last_refill > cutoff);
        before.saturating_sub(self.buckets.len())
    }
}
