//! Cache configuration.
//!
//! Controls the shared response cache via `soffio-guard.toml`.

use std::num::{NonZeroU64, NonZeroUsize};
use std::time::Duration;

// Default values for cache configuration
pub(crate) const DEFAULT_TTL_SECONDS: u64 = 300;
pub(crate) const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub(crate) const DEFAULT_EVICTION_PERCENT: u8 = 10;
pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub(crate) const DEFAULT_NAMESPACE: &str = "soffio-guard:";

/// Validated cache configuration.
///
/// Zero TTLs and zero capacities are unrepresentable; invalid values are
/// rejected while loading settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable the response cache.
    pub enabled: bool,
    /// TTL applied when a caller does not supply one.
    pub default_ttl: NonZeroU64,
    /// Live entry count that triggers batch eviction.
    pub max_entries: NonZeroUsize,
    /// Share of entries evicted per batch, in percent (1..=100).
    pub eviction_percent: u8,
    /// Largest origin body buffered for caching.
    pub max_body_bytes: usize,
    /// Prefix for every key written to the shared store.
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: NonZeroU64::new(DEFAULT_TTL_SECONDS).unwrap_or(NonZeroU64::MIN),
            max_entries: NonZeroUsize::new(DEFAULT_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            eviction_percent: DEFAULT_EVICTION_PERCENT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            default_ttl: settings.default_ttl_seconds,
            max_entries: settings.max_entries,
            eviction_percent: settings.eviction_percent,
            max_body_bytes: settings.max_body_bytes,
            namespace: settings.namespace.clone(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl.get())
    }

    /// Number of entries evicted when `live` entries are present, never below one.
    pub fn eviction_quota(&self, live: u64) -> usize {
        let percent = u64::from(self.eviction_percent.clamp(1, 100));
        let quota = (live * percent).div_ceil(100);
        quota.max(1) as usize
    }

    pub(crate) fn entry_prefix(&self) -> String {
        format!("{}cache:entry:", self.namespace)
    }

    pub(crate) fn recency_index(&self) -> String {
        format!("{}cache:recency", self.namespace)
    }
}
