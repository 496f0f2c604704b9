//! Live tests against a running Redis.
//!
//! - Marked `#[ignore]`; run with `cargo test -- --ignored`.
//! - Reads the connection URL from `SOFFIO_GUARD_TEST_REDIS_URL`.
//! - Every test uses its own key namespace and cleans up after itself.

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use soffio_guard::cache::{CacheConfig, CacheStore};
use soffio_guard::clock::{Clock, SystemClock};
use soffio_guard::rate_limit::{RateLimiter, TierConfig};
use soffio_guard::store::{Batch, EphemeralStore, RedisStore, RedisStoreConfig, Reply};
use uuid::Uuid;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn connect() -> TestResult<Arc<RedisStore>> {
    let url = std::env::var("SOFFIO_GUARD_TEST_REDIS_URL")
        .map_err(|_| "SOFFIO_GUARD_TEST_REDIS_URL must be set for live tests")?;
    let store = RedisStore::connect(&RedisStoreConfig {
        url,
        pool_size: 4,
        timeout: Duration::from_secs(2),
    })?;
    Ok(Arc::new(store))
}

fn namespace() -> String {
    format!("soffio-guard-test:{}:", Uuid::new_v4().simple())
}

async fn cleanup(store: &RedisStore, namespace: &str) -> TestResult<()> {
    let keys = store.scan_prefix(namespace).await?;
    store.delete(&keys).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
#[serial]
async fn live_atomic_batch_replies_in_order() -> TestResult<()> {
    let store = connect()?;
    store.ping().await?;
    let ns = namespace();
    let set = format!("{ns}window");

    let replies = store
        .execute_atomic(
            Batch::new()
                .zadd(set.as_str(), 10, "a")
                .zadd(set.as_str(), 20, "b")
                .zrem_range_by_score(set.as_str(), i64::MIN, 10)
                .zcard(set.as_str())
                .zrange(set.as_str(), 0, 0)
                .expire(set.as_str(), Duration::from_secs(5)),
        )
        .await?;

    assert_eq!(replies.len(), 6);
    assert_eq!(replies[3], Reply::Int(1));
    let oldest = replies[4].clone().into_members()?;
    assert_eq!(oldest[0].member, "b");
    assert_eq!(oldest[0].score, 20);

    cleanup(&store, &ns).await
}

#[tokio::test]
#[ignore]
#[serial]
async fn live_scan_prefix_escapes_glob_characters() -> TestResult<()> {
    let store = connect()?;
    let ns = namespace();

    store
        .set_with_expiry(&format!("{ns}a*b"), b"1".to_vec(), Duration::from_secs(5))
        .await?;
    store
        .set_with_expiry(&format!("{ns}axb"), b"2".to_vec(), Duration::from_secs(5))
        .await?;

    let keys = store.scan_prefix(&format!("{ns}a*")).await?;
    assert_eq!(keys, vec![format!("{ns}a*b")]);

    cleanup(&store, &ns).await
}

#[tokio::test]
#[ignore]
#[serial]
async fn live_cache_round_trip_and_invalidate() -> TestResult<()> {
    let store = connect()?;
    let ns = namespace();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = CacheStore::new(
        store.clone(),
        clock,
        CacheConfig {
            max_entries: NonZeroUsize::new(3).expect("capacity"),
            namespace: ns.clone(),
            ..Default::default()
        },
    );

    for index in 0..5u32 {
        cache
            .set(&format!("posts:{index}"), &index, Some(Duration::from_secs(30)))
            .await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(cache.entry_count().await? <= 3);
    assert_eq!(cache.get::<u32>("posts:4").await, Some(4));
    assert_eq!(cache.get::<u32>("posts:0").await, None);

    assert!(cache.invalidate("posts:").await >= 1);
    assert_eq!(cache.get::<u32>("posts:4").await, None);

    cache.clear().await;
    cleanup(&store, &ns).await
}

#[tokio::test]
#[ignore]
#[serial]
async fn live_rate_limit_window() -> TestResult<()> {
    let store = connect()?;
    let ns = namespace();
    let limiter = RateLimiter::new(
        store.clone(),
        Arc::new(SystemClock),
        vec![TierConfig::new(
            "api",
            Duration::from_millis(500),
            NonZeroU32::new(3).expect("non-zero"),
        )],
        ns.clone(),
    )?;

    for _ in 0..3 {
        assert!(limiter.check("api", "addr:127.0.0.1").await.is_allowed());
    }
    let verdict = limiter.check("api", "addr:127.0.0.1").await;
    assert!(!verdict.is_allowed());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(limiter.check("api", "addr:127.0.0.1").await.is_allowed());

    cleanup(&store, &ns).await
}
