use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "soffio_guard_cache_hit_total",
            Unit::Count,
            "Total number of response-cache hits."
        );
        describe_counter!(
            "soffio_guard_cache_miss_total",
            Unit::Count,
            "Total number of response-cache misses, including lookups that failed open."
        );
        describe_counter!(
            "soffio_guard_cache_evict_total",
            Unit::Count,
            "Total number of cache entries evicted due to capacity."
        );
        describe_counter!(
            "soffio_guard_cache_store_error_total",
            Unit::Count,
            "Total number of cache operations that failed against the store."
        );
        describe_counter!(
            "soffio_guard_ratelimit_allowed_total",
            Unit::Count,
            "Total number of rate-limit checks that allowed the request, by tier."
        );
        describe_counter!(
            "soffio_guard_ratelimit_rejected_total",
            Unit::Count,
            "Total number of rate-limit checks that rejected the request, by tier."
        );
        describe_counter!(
            "soffio_guard_ratelimit_store_error_total",
            Unit::Count,
            "Total number of rate-limit checks that failed open on store errors."
        );
        describe_gauge!(
            "soffio_guard_load_lag_ms",
            Unit::Milliseconds,
            "Latest measured event loop lag in milliseconds."
        );
        describe_counter!(
            "soffio_guard_overload_reject_total",
            Unit::Count,
            "Total number of requests shed because the process was overloaded."
        );
    });
}
