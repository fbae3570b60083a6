//! Sliding window log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::algorithm::{Admission, Decision};
use super::backend::CounterStore;
use super::key::LimiterKey;
use crate::clock::{delta, later, retry_secs};
use crate::config::Algorithm;
use crate::error::Result;

/// Keeps the timestamps of admitted requests and admits while fewer than
/// `limit` of them fall inside `[now - window, now]`. Denied requests are not
/// recorded, so a client hammering a closed window does not extend it.
pub struct SlidingWindow {
    window: Duration,
    store: Arc<dyn CounterStore>,
}

impl SlidingWindow {
    pub fn new(window: Duration, store: Arc<dyn CounterStore>) -> Self {
        Self { window, store }
    }

    /// Admitted requests inside the window ending at `now`.
    pub async fn count(&self, identifier: &str, now: DateTime<Utc>) -> Result<u64> {
        let key = LimiterKey::sliding(identifier);
        self.store.window_count(&key.to_string_key(), now, self.window).await
    }
}

#[async_trait]
impl Admission for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn admit(&self, identifier: &str, limit: u64, now: DateTime<Utc>) -> Decision {
        let key = LimiterKey::sliding(identifier);
        let reset_time = later(now, delta(self.window));

        let admission = match self
            .store
            .window_admit(&key.to_string_key(), now, self.window, limit)
            .await
        {
            Ok(admission) => admission,
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

        trace!(key = %key, count = admission.count, limit = limit, "Sliding window admission");

        let retry_after = if admission.admitted {
            None
        } else {
            debug!(identifier = %identifier, limit = limit, "Rate limit exceeded");
            // The first slot frees up when the oldest entry leaves the window.
            let frees_at = admission
                .oldest
                .map_or(reset_time, |oldest| later(oldest, delta(self.window)));
            Some(retry_secs(now, frees_at))
        };

        Decision {
            allowed: admission.admitted,
            remaining: limit.saturating_sub(admission.count),
            reset_time,
            retry_after,
        }
    }
}
