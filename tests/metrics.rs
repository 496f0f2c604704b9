use std::collections::HashSet;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use soffio_guard::cache::{CacheConfig, CacheStore};
use soffio_guard::clock::ManualClock;
use soffio_guard::infra::telemetry;
use soffio_guard::load::{LoadConfig, LoadMonitor};
use soffio_guard::pipeline::{RequestConfig, RequestPipeline, RoutePolicy, RouteTable, guard_layer};
use soffio_guard::rate_limit::{RateLimiter, TierConfig};
use soffio_guard::store::MemoryStore;
use tower::ServiceExt;

#[tokio::test]
async fn guard_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));

    // Cache hit, miss, eviction and store errors.
    let cache = CacheStore::new(
        store.clone(),
        clock.clone(),
        CacheConfig {
            max_entries: NonZeroUsize::new(1).expect("capacity"),
            ..Default::default()
        },
    );
    cache.set("a", &1u32, None).await;
    assert_eq!(cache.get::<u32>("a").await, Some(1));
    assert_eq!(cache.get::<u32>("missing").await, None);
    cache.set("b", &2u32, None).await;
    store.set_available(false);
    assert_eq!(cache.get::<u32>("b").await, None);
    store.set_available(true);

    // Rate limit allowed, rejected and store errors.
    let limiter = RateLimiter::new(
        store.clone(),
        clock.clone(),
        vec![TierConfig::new(
            "api",
            Duration::from_secs(60),
            NonZeroU32::new(1).expect("non-zero"),
        )],
        "soffio-guard:",
    )
    .expect("tiers");
    assert!(limiter.check("api", "addr:1.1.1.1").await.is_allowed());
    assert!(!limiter.check("api", "addr:1.1.1.1").await.is_allowed());
    store.set_available(false);
    assert!(limiter.check("api", "addr:1.1.1.1").await.is_allowed());
    store.set_available(true);

    // Load gauge and overload rejections through the middleware.
    let load = LoadMonitor::new(&LoadConfig::default());
    let pipeline = RequestPipeline::new(
        load.clone(),
        limiter,
        Some(cache),
        RouteTable::new(vec![RoutePolicy::new("/")]),
        RequestConfig::default(),
    )
    .expect("pipeline");
    let app = Router::new()
        .route("/", get(|| async { StatusCode::OK }))
        .layer(middleware::from_fn_with_state(pipeline, guard_layer));

    load.record_sample(Duration::from_millis(250));
    let request = Request::builder()
        .method(Method::GET)
        .uri("/")
        .body(Body::empty())
        .expect("request should build");
    let response = app.oneshot(request).await.expect("router should respond");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "soffio_guard_cache_hit_total",
        "soffio_guard_cache_miss_total",
        "soffio_guard_cache_evict_total",
        "soffio_guard_cache_store_error_total",
        "soffio_guard_ratelimit_allowed_total",
        "soffio_guard_ratelimit_rejected_total",
        "soffio_guard_ratelimit_store_error_total",
        "soffio_guard_load_lag_ms",
        "soffio_guard_overload_reject_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
