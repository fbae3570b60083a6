//! Fixed window counting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::algorithm::{Admission, Decision};
use super::backend::CounterStore;
use super::key::LimiterKey;
use crate::clock::retry_secs;
use crate::config::Algorithm;

/// Counts requests in consecutive, non-overlapping windows aligned to the
/// Unix epoch. The counter for a window lives in the store under a key
/// carrying the window index and expires at the window boundary.
pub struct FixedWindow {
    window_secs: i64,
    store: Arc<dyn CounterStore>,
}

impl FixedWindow {
    pub fn new(window: Duration, store: Arc<dyn CounterStore>) -> Self {
        Self {
            window_secs: (window.as_secs() as i64).max(1),
            store,
        }
    }

    /// Index of the window containing `now`, and the instant it ends.
    fn window_at(&self, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
        let index = now.timestamp().div_euclid(self.window_secs);
        let reset = DateTime::from_timestamp((index + 1) * self.window_secs, 0).unwrap_or(now);
        (index, reset)
    }
}

#[async_trait]
impl Admission for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn admit(&self, identifier: &str, limit: u64, now: DateTime<Utc>) -> Decision {
        let (index, reset_time) = self.window_at(now);
        let key = LimiterKey::fixed(identifier, index);
        let ttl = (reset_time - now).to_std().unwrap_or_default();

        let count = match self.store.incr_with_expiry(&key.to_string_key(), now, ttl).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key = %key, error = %e, "Counter store failed, admitting request");
                return Decision {
                    allowed: true,
                    remaining: limit.saturating_sub(1),
                    reset_time,
                    retry_after: None,
                };
            }
        };

        let allowed = count <= limit;
        trace!(key = %key, count = count, limit = limit, "Fixed window admission");
        if !allowed {
            debug!(identifier = %identifier, limit = limit, "Rate limit exceeded");
        }

        Decision {
            allowed,
            remaining: limit.saturating_sub(count),
            reset_time,
            retry_after: (!allowed).then(|| retry_secs(now, reset_time)),
        }
    }
}
