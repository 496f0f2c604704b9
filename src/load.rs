//! Event-loop lag based admission control.
//!
//! A background task sleeps for a fixed interval and measures how late it wakes
//! up. The overshoot is the scheduler lag; once it exceeds the threshold every
//! new request is rejected until a later sample comes back under it. The latest
//! sample always wins and the state is process-local.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

const TARGET: &str = "soffio_guard::load";

pub(crate) const DEFAULT_MAX_LAG_MS: u64 = 70;
pub(crate) const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub enabled: bool,
    pub max_lag: Duration,
    pub sample_interval: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_lag: Duration::from_millis(DEFAULT_MAX_LAG_MS),
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
        }
    }
}

impl From<&crate::config::LoadSettings> for LoadConfig {
    fn from(settings: &crate::config::LoadSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_lag: Duration::from_millis(settings.max_lag_ms),
            sample_interval: Duration::from_millis(settings.sample_interval_ms.get()),
        }
    }
}

#[derive(Debug)]
struct LoadState {
    overloaded: AtomicBool,
    lag_ms: AtomicU64,
}

/// Cheap, clonable handle to the latest load sample.
#[derive(Debug, Clone)]
pub struct LoadMonitor {
    state: Arc<LoadState>,
    max_lag: Duration,
    sample_interval: Duration,
    enabled: bool,
}

impl LoadMonitor {
    /// A monitor with no sampling task; feed it with [`LoadMonitor::record_sample`].
    pub fn new(config: &LoadConfig) -> Self {
        Self {
            state: Arc::new(LoadState {
                overloaded: AtomicBool::new(false),
                lag_ms: AtomicU64::new(0),
            }),
            max_lag: config.max_lag,
            sample_interval: config.sample_interval,
            enabled: config.enabled,
        }
    }

    /// Start sampling on the current runtime. Disabled monitors never spawn and
    /// always report healthy.
    pub fn spawn(config: &LoadConfig) -> (Self, Option<JoinHandle<()>>) {
        let monitor = Self::new(config);
        if !config.enabled {
            return (monitor, None);
        }

        let interval = config.sample_interval;
        let sampler = monitor.clone();
        let handle = tokio::spawn(async move {
            loop {
                let started = Instant::now();
                tokio::time::sleep(interval).await;
                let lag = started.elapsed().saturating_sub(interval);
                sampler.record_sample(lag);
            }
        });
        (monitor, Some(handle))
    }

    pub fn is_overloaded(&self) -> bool {
        self.enabled && self.state.overloaded.load(Ordering::Relaxed)
    }

    pub fn lag_ms(&self) -> u64 {
        self.state.lag_ms.load(Ordering::Relaxed)
    }

    pub fn max_lag(&self) -> Duration {
        self.max_lag
    }

    /// Retry hint for shed requests: the next sample may clear the flag.
    pub fn retry_after_secs(&self) -> u64 {
        self.sample_interval.as_millis().div_ceil(1000).max(1) as u64
    }

    /// Store a lag measurement and recompute the overloaded flag.
    pub fn record_sample(&self, lag: Duration) {
        let lag_ms = u64::try_from(lag.as_millis()).unwrap_or(u64::MAX);
        self.state.lag_ms.store(lag_ms, Ordering::Relaxed);
        gauge!("soffio_guard_load_lag_ms").set(lag_ms as f64);

        let overloaded = lag > self.max_lag;
        let was = self.state.overloaded.swap(overloaded, Ordering::Relaxed);
        match (was, overloaded) {
            (false, true) => warn!(
                target: TARGET,
                lag_ms,
                max_lag_ms = self.max_lag.as_millis() as u64,
                "event loop lag over threshold; shedding load"
            ),
            (true, false) => info!(target: TARGET, lag_ms, "event loop lag recovered"),
            _ => {}
        }
    }

    /// Count a request shed because of overload.
    pub(crate) fn note_rejection(&self) {
        counter!("soffio_guard_overload_reject_total").increment(1);
    }
}
