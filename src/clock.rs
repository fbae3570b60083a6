//! Injectable time sources.
//!
//! Every component reads time through [`Clock`] so window boundaries, refill
//! and decay can be driven deterministically in tests with [`SimulatedClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// A source of wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// hand another to the service.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    micros: Arc<AtomicI64>,
}

impl SimulatedClock {
    /// Create a clock frozen at the given Unix timestamp in seconds.
    pub fn at_secs(secs: i64) -> Self {
        Self {
            micros: Arc::new(AtomicI64::new(secs.saturating_mul(1_000_000))),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        self.micros.store(to.timestamp_micros(), Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// Seconds since the Unix epoch with microsecond precision.
pub fn epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Inverse of [`epoch_secs`].
pub fn from_epoch_secs(secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64).unwrap_or_default()
}

/// Longest span ever added to a timestamp.
const MAX_SPAN_DAYS: i64 = 36_500;

/// Convert a std duration into a chrono delta, saturating at a century so
/// timestamp arithmetic cannot overflow.
pub fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d)
        .unwrap_or(TimeDelta::MAX)
        .min(TimeDelta::days(MAX_SPAN_DAYS))
}

/// A span of whole seconds, saturating like [`delta`].
pub fn secs(secs: u64) -> TimeDelta {
    delta(Duration::from_secs(secs))
}

/// `ts - span`, clamped to the earliest representable time.
pub fn earlier(ts: DateTime<Utc>, span: TimeDelta) -> DateTime<Utc> {
    ts.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `ts + span`, clamped to the latest representable time.
pub fn later(ts: DateTime<Utc>, span: TimeDelta) -> DateTime<Utc> {
    ts.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole seconds from `now` until `until`, rounded up, never below one.
pub fn retry_secs(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    let micros = (until - now).num_microseconds().unwrap_or(i64::MAX).max(0);
    let secs = (micros as u64).div_ceil(1_000_000);
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_advances() {
        let clock = SimulatedClock::at_secs(1_000);
        assert_eq!(clock.now().timestamp(), 1_000);

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now().timestamp_millis(), 1_001_500);
    }

    #[test]
    fn test_simulated_clock_clones_share_time() {
        let clock = SimulatedClock::at_secs(10);
        let handle = clock.clone();
        handle.advance(Duration::from_secs(5));
        assert_eq!(clock.now().timestamp(), 15);
    }

    #[test]
    fn test_epoch_secs_roundtrip() {
        let ts = SimulatedClock::at_secs(1_700_000_000).now();
        assert_eq!(from_epoch_secs(epoch_secs(ts)), ts);
    }

    #[test]
    fn test_retry_secs_rounds_up() {
        let clock = SimulatedClock::at_secs(100);
        let now = clock.now();
        let later = now + TimeDelta::milliseconds(1_200);
        assert_eq!(retry_secs(now, later), Duration::from_secs(2));
        assert_eq!(retry_secs(now, now), Duration::from_secs(1));
    }

    #[test]
    fn test_offsets_saturate_at_time_bounds() {
        let min = DateTime::<Utc>::MIN_UTC;
        let max = DateTime::<Utc>::MAX_UTC;
        assert_eq!(earlier(min, secs(60)), min);
        assert_eq!(later(max, secs(60)), max);
        assert_eq!(secs(u64::MAX), TimeDelta::days(MAX_SPAN_DAYS));

        let ts = SimulatedClock::at_secs(1_000).now();
        assert_eq!(earlier(ts, secs(10)).timestamp(), 990);
        assert_eq!(later(ts, secs(10)).timestamp(), 1_010);
    }
}
