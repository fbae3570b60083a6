//! End-to-end behavior of the rate limit service.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rampart::clock::{Clock, SimulatedClock};
use rampart::config::{Algorithm, RampartConfig};
use rampart::detection::{AttackType, Observation};
use rampart::error::{RampartError, Result};
use rampart::events::SecurityEvent;
use rampart::ratelimit::{CounterStore, LocalStore, RateLimitService, WindowAdmission};

/// Aligned to a 60 second window boundary.
const START: i64 = 1_699_999_980;

fn config(algorithm: Algorithm, max_requests: u64, detection: bool) -> RampartConfig {
    let mut config = RampartConfig::default();
    config.rate_limit.algorithm = algorithm;
    config.rate_limit.max_requests = max_requests;
    config.rate_limit.min_limit = 1;
    config.rate_limit.enable_attack_detection = detection;
    config
}

fn service(config: RampartConfig) -> (Arc<RateLimitService>, SimulatedClock) {
    let clock = SimulatedClock::at_secs(START);
    let service = RateLimitService::with_clock(config, Arc::new(clock.clone())).unwrap();
    (Arc::new(service), clock)
}

fn request(clock: &SimulatedClock) -> Observation {
    Observation::new("198.51.100.7", "/api/items", "GET", clock.now()).with_user_agent("curl/8.4.0")
}

fn login(clock: &SimulatedClock, success: bool) -> Observation {
    Observation::new("198.51.100.7", "/api/login", "POST", clock.now())
        .with_user_agent("python-requests/2.31")
        .with_success(success)
}

#[tokio::test]
async fn fixed_window_admits_exactly_limit_then_resets() {
    let (service, clock) = service(config(Algorithm::FixedWindow, 10, false));

    let mut allowed = 0;
    for _ in 0..11 {
        if service.check("client", &request(&clock)).await.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);

    clock.advance(Duration::from_secs(60));
    let result = service.check("client", &request(&clock)).await;
    assert!(result.allowed);
    assert_eq!(result.remaining_requests, 9);
}

#[tokio::test]
async fn sliding_window_counts_only_recent_requests() {
    let (service, clock) = service(config(Algorithm::SlidingWindow, 3, false));

    for _ in 0..3 {
        assert!(service.check("client", &request(&clock)).await.allowed);
        clock.advance(Duration::from_secs(10));
    }
    let denied = service.check("client", &request(&clock)).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));

    // The first request leaves the window at START + 60.
    clock.set(DateTime::from_timestamp(START + 61, 0).unwrap());
    let result = service.check("client", &request(&clock)).await;
    assert!(result.allowed);
    assert_eq!(result.remaining_requests, 0);
}

#[tokio::test]
async fn token_bucket_never_admits_more_than_refilled() {
    let mut config = config(Algorithm::TokenBucket, 10, false);
    config.rate_limit.window_secs = 10;
    let (service, clock) = service(config);

    let mut allowed = 0;
    for _ in 0..100 {
        if service.check("client", &request(&clock)).await.allowed {
            allowed += 1;
        }
        clock.advance(Duration::from_millis(250));
    }
    // 25 seconds at one token per second on top of a full bucket of 10.
    assert!(allowed <= 35, "allowed {}", allowed);
    assert!(allowed >= 34, "allowed {}", allowed);
}

#[tokio::test]
async fn token_bucket_refills_one_token_per_interval() {
    let mut config = config(Algorithm::TokenBucket, 10, false);
    config.rate_limit.window_secs = 10;
    let (service, clock) = service(config);

    for _ in 0..10 {
        assert!(service.check("client", &request(&clock)).await.allowed);
    }
    assert!(!service.check("client", &request(&clock)).await.allowed);

    clock.advance(Duration::from_secs(1));
    assert!(service.check("client", &request(&clock)).await.allowed);
    assert!(!service.check("client", &request(&clock)).await.allowed);
}

#[tokio::test]
async fn leaky_bucket_smooths_bursts() {
    let mut config = config(Algorithm::LeakyBucket, 5, false);
    config.rate_limit.window_secs = 5;
    let (service, clock) = service(config);

    let burst: Vec<bool> = futures::future::join_all(
        (0..8).map(|_| {
            let service = service.clone();
            let obs = request(&clock);
            async move { service.check("client", &obs).await.allowed }
        }),
    )
    .await;
    assert_eq!(burst.iter().filter(|a| **a).count(), 5);

    clock.advance(Duration::from_secs(1));
    assert!(service.check("client", &request(&clock)).await.allowed);
    assert!(!service.check("client", &request(&clock)).await.allowed);
}

#[tokio::test]
async fn brute_force_detected_at_sixth_failure() {
    let (service, clock) = service(config(Algorithm::SlidingWindow, 100, true));

    for _ in 0..5 {
        let result = service.check("198.51.100.7", &login(&clock, false)).await;
        assert!(!result.attack_detected);
        assert_eq!(result.limit, 100);
    }

    let result = service.check("198.51.100.7", &login(&clock, false)).await;
    assert!(result.attack_detected);
    let pattern = &result.attack_patterns[0];
    assert_eq!(pattern.attack_type, AttackType::BruteForce);
    assert_eq!(pattern.severity, 7);
    assert_eq!(result.limit, 93);
}

#[tokio::test]
async fn adaptive_limit_recovers_one_per_clean_call() {
    let (service, clock) = service(config(Algorithm::SlidingWindow, 100, true));

    for _ in 0..6 {
        service.check("198.51.100.7", &login(&clock, false)).await;
    }
    assert_eq!(service.controller().effective_limit("198.51.100.7"), 93);

    // Leave the brute force window behind.
    clock.advance(Duration::from_secs(61));
    for expected in 94..=97 {
        let result = service.check("198.51.100.7", &request(&clock)).await;
        assert!(!result.attack_detected);
        assert_eq!(result.limit, expected);
        clock.advance(Duration::from_secs(1));
    }
}

#[tokio::test]
async fn high_confidence_pattern_overrides_available_quota() {
    let (service, clock) = service(config(Algorithm::FixedWindow, 1000, true));

    for _ in 0..19 {
        service.check("198.51.100.7", &login(&clock, false)).await;
    }
    let result = service.check("198.51.100.7", &login(&clock, true)).await;

    let brute_force = result
        .attack_patterns
        .iter()
        .find(|p| p.attack_type == AttackType::BruteForce)
        .unwrap();
    assert!((brute_force.confidence - 0.95).abs() < 1e-9);
    assert!(!result.allowed);
    assert_eq!(result.remaining_requests, 0);
    assert_eq!(result.retry_after, Some(Duration::from_secs(300)));
    assert_eq!(result.reset_time, clock.now() + chrono::TimeDelta::seconds(300));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_admit_exactly_the_limit() {
    for algorithm in [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ] {
        let (service, clock) = service(config(algorithm, 50, false));
        let admitted = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..400)
            .map(|_| {
                let service = service.clone();
                let admitted = admitted.clone();
                let obs = request(&clock);
                tokio::spawn(async move {
                    if service.check("shared", &obs).await.allowed {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 50, "{}", algorithm);
    }
}

#[tokio::test]
async fn identifiers_never_share_state() {
    let (service, clock) = service(config(Algorithm::FixedWindow, 1, false));

    assert!(service.check("alice", &request(&clock)).await.allowed);
    assert!(service.check("bob", &request(&clock)).await.allowed);
    assert!(!service.check("alice", &request(&clock)).await.allowed);
}

/// A distributed store that is down or hanging.
struct BrokenStore {
    hang: bool,
}

impl BrokenStore {
    async fn fail<T>(&self) -> Result<T> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Err(RampartError::Backend("connection refused".to_string()))
    }
}

#[async_trait]
impl CounterStore for BrokenStore {
    fn name(&self) -> &str {
        "broken"
    }

    async fn incr_with_expiry(&self, _key: &str, _now: DateTime<Utc>, _ttl: Duration) -> Result<u64> {
        self.fail().await
    }

    async fn window_admit(
        &self,
        _key: &str,
        _now: DateTime<Utc>,
        _window: Duration,
        _limit: u64,
    ) -> Result<WindowAdmission> {
        self.fail().await
    }

    async fn window_count(&self, _key: &str, _now: DateTime<Utc>, _window: Duration) -> Result<u64> {
        self.fail().await
    }
}

fn degraded_service(algorithm: Algorithm, hang: bool) -> (Arc<RateLimitService>, SimulatedClock) {
    let mut config = config(algorithm, 3, false);
    config.backend.timeout_ms = 20;
    let clock = SimulatedClock::at_secs(START);
    let service = RateLimitService::with_parts(
        config,
        Arc::new(clock.clone()),
        Some(Arc::new(BrokenStore { hang })),
    )
    .unwrap();
    (Arc::new(service), clock)
}

#[tokio::test]
async fn backend_failure_falls_back_to_local_counters() {
    let (service, clock) = degraded_service(Algorithm::FixedWindow, false);
    let mut events = service.subscribe();

    let requests: Vec<Observation> = (0..4).map(|_| request(&clock)).collect();
    let decisions: Vec<bool> =
        futures::future::join_all(requests.iter().map(|obs| service.check("client", obs)))
            .await
            .into_iter()
            .map(|r| r.allowed)
            .collect();
    assert_eq!(decisions.iter().filter(|a| **a).count(), 3);

    match events.try_recv().unwrap() {
        SecurityEvent::BackendDegraded { backend, error } => {
            assert_eq!(backend, "broken");
            assert!(error.contains("connection refused"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn slow_backend_is_bounded_by_timeout() {
    let (service, clock) = degraded_service(Algorithm::SlidingWindow, true);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        service.check("client", &request(&clock)),
    )
    .await
    .expect("check must not wait for the backend");
    assert!(result.allowed);
    assert_eq!(result.remaining_requests, 2);
}

/// Delegates to an in-process store until switched off.
struct FlakyStore {
    inner: LocalStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn gate(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RampartError::Backend("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn incr_with_expiry(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<u64> {
        self.gate()?;
        self.inner.incr_with_expiry(key, now, ttl).await
    }

    async fn window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
    ) -> Result<WindowAdmission> {
        self.gate()?;
        self.inner.window_admit(key, now, window, limit).await
    }

    async fn window_count(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<u64> {
        self.gate()?;
        self.inner.window_count(key, now, window).await
    }
}

#[tokio::test]
async fn backend_outage_mid_window_does_not_over_admit() {
    for algorithm in [Algorithm::FixedWindow, Algorithm::SlidingWindow] {
        let primary = Arc::new(FlakyStore {
            inner: LocalStore::new(),
            down: AtomicBool::new(false),
        });
        let backend: Arc<dyn CounterStore> = primary.clone();
        let clock = SimulatedClock::at_secs(START);
        let service = RateLimitService::with_parts(
            config(algorithm, 5, false),
            Arc::new(clock.clone()),
            Some(backend),
        )
        .unwrap();
        let mut events = service.subscribe();

        for _ in 0..3 {
            assert!(service.check("client", &request(&clock)).await.allowed);
            clock.advance(Duration::from_secs(1));
        }

        primary.down.store(true, Ordering::SeqCst);
        let mut allowed = 0;
        for _ in 0..5 {
            if service.check("client", &request(&clock)).await.allowed {
                allowed += 1;
            }
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(allowed, 2, "{} admitted past the limit", algorithm);

        let denied = service.check("client", &request(&clock)).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_requests, 0);
        assert!(denied.retry_after.is_some());
        assert!(denied.reset_time >= clock.now());
        assert!(matches!(
            events.try_recv(),
            Ok(SecurityEvent::BackendDegraded { .. })
        ));
    }
}

#[tokio::test]
async fn events_serialize_with_tag() {
    let (service, clock) = service(config(Algorithm::SlidingWindow, 100, true));
    let mut events = service.subscribe();

    for _ in 0..6 {
        service.check("198.51.100.7", &login(&clock, false)).await;
    }

    let mut tags = Vec::new();
    while let Ok(event) = events.try_recv() {
        let json = serde_json::to_value(&event).unwrap();
        tags.push(json["event"].as_str().unwrap().to_string());
    }
    assert!(tags.contains(&"attack_pattern_detected".to_string()));
    assert!(tags.contains(&"identifier_blocked".to_string()));
}

#[tokio::test]
async fn replay_lines_parse_into_observations() {
    let line = r#"{"identifier":"203.0.113.9","endpoint":"/login","method":"POST","timestamp":"2023-11-14T22:13:00Z","success":false,"response_time":0.25}"#;
    let obs: Observation = serde_json::from_str(line).unwrap();
    assert_eq!(obs.identifier, "203.0.113.9");
    assert!(!obs.success);
    assert_eq!(obs.response_time, Duration::from_millis(250));

    let minimal = r#"{"endpoint":"/","method":"GET","timestamp":"2023-11-14T22:13:00Z"}"#;
    let obs: Observation = serde_json::from_str(minimal).unwrap();
    assert!(obs.success);
    assert_eq!(obs.response_time, Duration::ZERO);

    let (service, _) = service(config(Algorithm::SlidingWindow, 100, true));
    let result = service.check(&obs.identifier, &obs).await;
    assert!(result.allowed);
    assert!(result.reset_time >= obs.timestamp);
}
