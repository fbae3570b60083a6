//! Distributed-first counter store with transparent local fallback.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use super::backend::{CounterStore, WindowAdmission};
use super::local::LocalStore;
use crate::clock::{delta, later};
use crate::error::{RampartError, Result};
use crate::events::{EventBus, SecurityEvent};

/// While degraded, the primary is retried at most this often.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Health {
    degraded: bool,
    next_probe: Option<DateTime<Utc>>,
}

/// Tries the primary store first and falls back to a [`LocalStore`].
///
/// Every primary call is bounded by a timeout. Failures are logged and
/// reported once per degradation through the event bus; they never reach the
/// caller. This node's traffic is mirrored into the local store while the
/// primary is healthy, so a switch mid-window keeps counting from where the
/// node left off. Counts kept locally during an outage are not merged back
/// into the primary, so peers drift apart until the affected windows roll
/// over.
pub struct FallbackStore {
    primary: Arc<dyn CounterStore>,
    local: LocalStore,
    timeout: Duration,
    health: Mutex<Health>,
    events: EventBus,
}

impl FallbackStore {
    pub fn new(
        primary: Arc<dyn CounterStore>,
        local: LocalStore,
        timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            primary,
            local,
            timeout,
            health: Mutex::new(Health::default()),
            events,
        }
    }

    /// Whether requests are currently served by the local store.
    pub fn is_degraded(&self) -> bool {
        self.health.lock().degraded
    }

    /// Run `op` against the primary, or return `None` when the local store
    /// must answer instead.
    async fn attempt<T, F>(&self, op: &'static str, now: DateTime<Utc>, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        if !self.should_try_primary(now) {
            return None;
        }

        let err = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.mark_healthy();
                return Some(value);
            }
            Ok(Err(e)) => e,
            Err(_) => RampartError::Timeout(self.timeout),
        };
        self.mark_degraded(op, now, &err);
        None
    }

    fn should_try_primary(&self, now: DateTime<Utc>) -> bool {
        let health = self.health.lock();
        !health.degraded || health.next_probe.map_or(true, |at| now >= at)
    }

    fn mark_healthy(&self) {
        let recovered = {
            let mut health = self.health.lock();
            std::mem::replace(&mut health.degraded, false)
        };
        if recovered {
            self.events.publish(SecurityEvent::BackendRecovered {
                backend: self.primary.name().to_string(),
            });
        }
    }

    fn mark_degraded(&self, op: &str, now: DateTime<Utc>, err: &RampartError) {
        warn!(
            backend = %self.primary.name(),
            operation = op,
            error = %err,
            "Counter backend call failed, answering from local store"
        );

        let newly_degraded = {
            let mut health = self.health.lock();
            health.next_probe = Some(later(now, delta(PROBE_INTERVAL)));
            !std::mem::replace(&mut health.degraded, true)
        };
        if newly_degraded {
            self.events.publish(SecurityEvent::BackendDegraded {
                backend: self.primary.name().to_string(),
                error: err.to_string(),
            });
        }
    }
}

#[async_trait]
impl CounterStore for FallbackStore {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn incr_with_expiry(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<u64> {
        let primary = self.primary.incr_with_expiry(key, now, ttl);
        let answer = self.attempt("incr_with_expiry", now, primary).await;
        let local = self.local.incr_with_expiry(key, now, ttl).await?;
        Ok(answer.unwrap_or(local))
    }

    async fn window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<WindowAdmission> {
        let primary = self.primary.window_admit(key, now, window, limit);
        match self.attempt("window_admit", now, primary).await {
            Some(admission) => {
                if admission.admitted {
                    self.local.window_admit(key, now, window, u64::MAX).await?;
                }
                Ok(admission)
            }
            None => self.local.window_admit(key, now, window, limit).await,
        }
    }

    async fn window_count(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<u64> {
        let primary = self.primary.window_count(key, now, window);
        match self.attempt("window_count", now, primary).await {
            Some(count) => Ok(count),
            None => self.local.window_count(key, now, window).await,
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let local = self.local.purge_expired(now).await;
        let primary = self.primary.purge_expired(now);
        local + tokio::time::timeout(self.timeout, primary).await.unwrap_or(0)
    }
}
