//! In-process counter store.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::backend::{CounterStore, WindowAdmission};
use crate::clock::{delta, earlier, later};
use crate::error::Result;

/// How long an idle sliding window log is kept when no retention is given.
const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// A fixed window counter with an absolute expiry.
#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Counter store backed by sharded in-process maps.
///
/// Every operation runs under the map entry's lock, so check-and-update is
/// atomic per key while unrelated keys proceed in parallel.
pub struct LocalStore {
    counters: DashMap<String, Counter>,
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    retention: Duration,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Keep sliding window logs for `retention` after their newest entry.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            counters: DashMap::new(),
            windows: DashMap::new(),
            retention,
        }
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.counters.len() + self.windows.len()
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.counters.clear();
        self.windows.clear();
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn incr_with_expiry(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<u64> {
        let mut counter = self.counters.entry(key.to_string()).or_insert_with(|| Counter {
            count: 0,
            expires_at: later(now, delta(ttl)),
        });

        if now >= counter.expires_at {
            counter.count = 0;
            counter.expires_at = later(now, delta(ttl));
        }
        counter.count += 1;

        trace!(key = %key, count = counter.count, "Incremented local counter");
        Ok(counter.count)
    }

    async fn window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<WindowAdmission> {
        let cutoff = earlier(now, delta(window));
        let mut log = self.windows.entry(key.to_string()).or_default();

        log.retain(|ts| *ts >= cutoff);
        let admitted = (log.len() as u64) < limit;
        if admitted {
            log.push_back(now);
        }

        Ok(WindowAdmission {
            admitted,
            count: log.len() as u64,
            oldest: log.iter().min().copied(),
        })
    }

    async fn window_count(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<u64> {
        let cutoff = earlier(now, delta(window));
        Ok(self.windows.get(key).map_or(0, |log| {
            log.iter().filter(|ts| **ts >= cutoff && **ts <= now).count() as u64
        }))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.key_count();
        let cutoff = earlier(now, delta(self.retention));

        self.counters.retain(|_, counter| counter.expires_at > now);
        self.windows
            .retain(|_, log| log.iter().max().is_some_and(|newest| *newest >= cutoff));

        before.saturating_sub(self.key_count())
    }
}
