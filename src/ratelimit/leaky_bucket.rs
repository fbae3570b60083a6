//! Leaky bucket.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::algorithm::{rate_per_sec, Admission, Decision};
use crate::clock::{delta, earlier, epoch_secs, later, retry_secs};
use crate::config::Algorithm;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    volume: f64,
    last_leak: DateTime<Utc>,
}

/// Each admitted request adds one unit of volume, which drains at
/// `limit / window` units per second. Requests are admitted while the bucket
/// holds less than `limit`.
pub struct LeakyBucket {
    window: Duration,
    buckets: DashMap<String, Bucket>,
}

impl LeakyBucket {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: DashMap::new(),
        }
    }

    /// Volume currently held for `identifier`, without leaking.
    pub fn volume(&self, identifier: &str) -> Option<f64> {
        self.buckets.get(identifier).map(|bucket| bucket.volume)
    }

    fn pour(&self, identifier: &str, limit: u64, now: DateTime<Utc>) -> Decision {
        let capacity = limit as f64;
        let rate = rate_per_sec(limit, self.window);

        let mut bucket = self
            .buckets
            .entry(identifier.to_string())
            .or_insert_with(|| Bucket {
                volume: 0.0,
                last_leak: now,
            });

        let elapsed = (epoch_secs(now) - epoch_secs(bucket.last_leak)).max(0.0);
        bucket.volume = (bucket.volume - elapsed * rate).max(0.0);
        bucket.last_leak = bucket.last_leak.max(now);

        let allowed = bucket.volume < capacity;
        if allowed {
            bucket.volume += 1.0;
        }
        let volume = bucket.volume;
        drop(bucket);

        trace!(identifier = %identifier, volume = volume, limit = limit, "Leaky bucket admission");

        let horizon = self.window.as_secs_f64();
        let until_empty = Duration::from_secs_f64((volume / rate).min(horizon));
        let retry_after = if allowed {
            None
        } else {
            debug!(identifier = %identifier, limit = limit, "Rate limit exceeded");
            let until_room =
                Duration::from_secs_f64(((volume - capacity + 1.0) / rate).clamp(0.0, horizon));
            Some(retry_secs(now, later(now, delta(until_room))))
        };

        Decision {
            allowed,
            remaining: (capacity - volume).max(0.0).floor() as u64,
            reset_time: later(now, delta(until_empty)),
            retry_after,
        }
    }
}

#[async_trait]
impl Admission for LeakyBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    async fn admit(&self, identifier: &str, limit: u64, now: DateTime<Utc>) -> Decision {
        self.pour(identifier, limit, now)
    }

    /// Any bucket idle for a whole window has drained completely.
    fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        let cutoff = earlier(now, delta(self.window));
        self.buckets.retain(|_, bucket| bucket.last_leak > cutoff);
        before.saturating_sub(self.buckets.len())
    }
}
