//! Counter store trait for abstracting local and distributed backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Outcome of a sliding window admission against a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    /// Whether the timestamp was recorded
    pub admitted: bool,
    /// Entries inside the window after the decision
    pub count: u64,
    /// Oldest entry still inside the window
    pub oldest: Option<DateTime<Utc>>,
}

/// Trait for counter store implementations.
///
/// This abstracts over the in-process [`LocalStore`](super::LocalStore) and
/// distributed stores such as the gossip mesh, so the fixed and sliding
/// window algorithms work with either. Each operation must be atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs and events.
    fn name(&self) -> &str;

    /// Add one to `key` and return the new total.
    ///
    /// A key that does not exist, or whose expiry has passed, starts again
    /// from zero and expires `ttl` after `now`.
    async fn incr_with_expiry(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<u64>;

    /// Remove entries older than `now - window`, then record `now` if fewer
    /// than `limit` entries remain.
    async fn window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<WindowAdmission>;

    /// Number of entries inside `[now - window, now]`.
    async fn window_count(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<u64>;

    /// Drop expired state. Returns how many keys were removed.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> usize {
        0
    }
}
