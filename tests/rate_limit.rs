use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use soffio_guard::clock::ManualClock;
use soffio_guard::rate_limit::{Decision, RateLimiter, TierConfig};
use soffio_guard::store::{EphemeralStore, MemoryStore};

#[path = "support/captured_logs.rs"]
mod captured_logs;

use captured_logs::CapturedLogs;

const START_MS: i64 = 1_700_000_000_000;

fn tier(name: &str, window_ms: u64, max: u32) -> TierConfig {
    TierConfig::new(
        name,
        Duration::from_millis(window_ms),
        NonZeroU32::new(max).expect("non-zero"),
    )
}

fn limiter(tiers: Vec<TierConfig>) -> (RateLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limiter =
        RateLimiter::new(store.clone(), clock.clone(), tiers, "soffio-guard:").expect("tiers");
    (limiter, store, clock)
}

#[tokio::test]
async fn admits_up_to_the_limit_then_rejects() {
    let (limiter, _, clock) = limiter(vec![tier("api", 1_000, 10)]);

    for attempt in 0..10 {
        let verdict = limiter.check("api", "addr:10.0.0.1").await;
        assert!(verdict.is_allowed(), "attempt {attempt} was rejected");
        clock.advance_ms(10);
    }

    let verdict = limiter.check("api", "addr:10.0.0.1").await;
    assert!(!verdict.is_allowed());
    assert_eq!(verdict.remaining, 0);
    assert_eq!(verdict.limit, 10);
}

#[tokio::test]
async fn rejected_attempts_consume_the_window() {
    let (limiter, _, clock) = limiter(vec![tier("api", 1_000, 10)]);

    for _ in 0..10 {
        assert!(limiter.check("api", "s").await.is_allowed());
    }
    // Ten more attempts inside the same window are all rejected and recorded.
    for _ in 0..10 {
        clock.advance_ms(50);
        assert!(!limiter.check("api", "s").await.is_allowed());
    }

    // The first ten have aged out but the rejected ones still count.
    clock.set(START_MS + 1_001);
    assert!(!limiter.check("api", "s").await.is_allowed());

    // Past the last attempt plus the window everything has aged out.
    clock.set(START_MS + 1_001 + 1_001);
    assert!(limiter.check("api", "s").await.is_allowed());
}

#[tokio::test]
async fn window_boundary_is_inclusive() {
    let (limiter, _, clock) = limiter(vec![tier("api", 1_000, 1)]);

    assert!(limiter.check("api", "s").await.is_allowed());

    // An attempt exactly one window later still sees the first one.
    clock.advance_ms(1_000);
    assert!(!limiter.check("api", "s").await.is_allowed());

    clock.advance_ms(1_001);
    assert!(limiter.check("api", "s").await.is_allowed());
}

#[tokio::test]
async fn retry_after_points_past_the_oldest_attempt() {
    let (limiter, _, clock) = limiter(vec![tier("api", 10_000, 2)]);

    limiter.check("api", "s").await;
    clock.advance_ms(2_000);
    limiter.check("api", "s").await;
    clock.advance_ms(500);

    let verdict = limiter.check("api", "s").await;
    // Oldest attempt leaves the window at START + 10_001; now is START + 2_500.
    assert_eq!(
        verdict.decision,
        Decision::Rejected {
            retry_after_secs: 8
        }
    );
    assert_eq!(verdict.reset_secs, 8);
}

#[tokio::test]
async fn same_millisecond_attempts_are_counted_separately() {
    let (limiter, _, _) = limiter(vec![tier("api", 1_000, 3)]);

    let mut allowed = 0;
    for _ in 0..5 {
        if limiter.check("api", "burst").await.is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3);
}

#[tokio::test]
async fn tiers_and_subjects_are_independent() {
    let (limiter, _, _) = limiter(vec![tier("api", 60_000, 2), tier("content", 60_000, 1)]);

    assert!(limiter.check("content", "user:7").await.is_allowed());
    assert!(!limiter.check("content", "user:7").await.is_allowed());

    // A different tier and a different subject have their own windows.
    assert!(limiter.check("api", "user:7").await.is_allowed());
    assert!(limiter.check("content", "user:8").await.is_allowed());
}

#[tokio::test]
async fn concurrent_checks_never_exceed_the_limit() {
    let (limiter, _, _) = limiter(vec![tier("api", 60_000, 25)]);

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check("api", "addr:1.2.3.4").await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.expect("task").is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 25);
}

#[tokio::test]
async fn check_all_reports_the_most_constrained_tier() {
    let (limiter, _, _) = limiter(vec![tier("api", 60_000, 100), tier("content", 60_000, 2)]);

    let checks = [("api", "addr:1.1.1.1"), ("content", "user:1")];
    limiter.check_all(&checks).await;
    let admission = limiter.check_all(&checks).await;

    assert!(admission.decision().is_allowed());
    let tightest = admission.most_constrained().expect("verdict");
    assert_eq!(tightest.tier, "content");
    assert_eq!(tightest.remaining, 0);

    let admission = limiter.check_all(&checks).await;
    assert_eq!(admission.rejecting_tier(), Some("content"));
    assert!(!admission.decision().is_allowed());
}

#[tokio::test]
async fn windows_expire_from_the_store() {
    let (limiter, store, clock) = limiter(vec![tier("api", 1_000, 5)]);

    limiter.check("api", "s").await;
    assert_eq!(
        store
            .zcard("soffio-guard:ratelimit:api:s")
            .await
            .expect("zcard"),
        1
    );

    clock.advance_ms(1_000);
    assert_eq!(store.key_count(), 0);
}

#[tokio::test]
async fn outage_fails_open() {
    let (limiter, store, _) = limiter(vec![tier("api", 60_000, 1)]);
    store.set_available(false);

    for _ in 0..5 {
        assert!(limiter.check("api", "s").await.is_allowed());
    }

    store.set_available(true);
    assert!(limiter.check("api", "s").await.is_allowed());
    assert!(!limiter.check("api", "s").await.is_allowed());
}

#[tokio::test]
async fn outage_is_logged_with_tier_and_subject() {
    let (limiter, store, _) = limiter(vec![tier("content", 60_000, 1)]);
    let logs = CapturedLogs::default();
    let _guard = logs.install();

    store.set_available(false);
    assert!(limiter.check("content", "user:alice").await.is_allowed());

    let lines = logs.lines_with(&[
        "WARN",
        "soffio_guard::ratelimit",
        "op=\"check\"",
        "tier=\"content\"",
        "subject=\"user:alice\"",
    ]);
    assert_eq!(lines.len(), 1, "logs:\n{}", logs.contents());
}
