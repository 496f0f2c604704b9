//! Read-through cache over the shared ephemeral store.
//!
//! Entries live at `<namespace>cache:entry:<key>` with a store-side TTL. A sorted
//! set at `<namespace>cache:recency` maps each key to its last access time and
//! drives approximate-LRU batch eviction. The index is advisory: the store may
//! expire an entry out-of-band and leave its member behind, so eviction checks
//! candidates for existence and prunes stale members as it goes.
//!
//! Every operation fails open. Store errors are logged and counted, a failed
//! lookup is a miss and a failed write is skipped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{Batch, EphemeralStore, StoreError};

use super::config::CacheConfig;

const TARGET: &str = "soffio_guard::cache";

#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    config: Arc<CacheConfig>,
    entry_prefix: Arc<str>,
    recency_index: Arc<str>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        let entry_prefix = Arc::from(config.entry_prefix());
        let recency_index = Arc::from(config.recency_index());
        Self {
            store,
            clock,
            config: Arc::new(config),
            entry_prefix,
            recency_index,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}{key}", self.entry_prefix)
    }

    fn cache_key<'a>(&self, entry_key: &'a str) -> &'a str {
        entry_key
            .strip_prefix(self.entry_prefix.as_ref())
            .unwrap_or(entry_key)
    }

    /// Fetch and decode `key`, refreshing its recency marker on a hit.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_raw(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target: TARGET,
                    op = "get",
                    key,
                    error = %err,
                    "cached value failed to decode; dropping entry"
                );
                self.remove_keys(vec![key.to_string()]).await;
                None
            }
        }
    }

    /// Fetch the serialized bytes stored under `key`.
    pub async fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        match self.store.get(&self.entry_key(key)).await {
            Ok(Some(bytes)) => {
                counter!("soffio_guard_cache_hit_total").increment(1);
                self.touch(key).await;
                Some(bytes)
            }
            Ok(None) => {
                counter!("soffio_guard_cache_miss_total").increment(1);
                None
            }
            Err(err) => {
                self.report_store_error("get", key, &err);
                counter!("soffio_guard_cache_miss_total").increment(1);
                None
            }
        }
    }

    /// Store `value` under `key`.
    ///
    /// Capacity is enforced before the write. `ttl` of `None` (or zero) uses the
    /// configured default. Values that cannot be serialized are not cached.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(
                    target: TARGET,
                    op = "set",
                    key,
                    error = %err,
                    "value is not serializable; skipping cache"
                );
                return;
            }
        };
        self.set_raw(key, bytes, ttl).await;
    }

    /// Store pre-serialized bytes. Overwriting a live entry does not grow the
    /// cache, so capacity is only enforced for new keys.
    pub async fn set_raw(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) {
        let ttl = ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or_else(|| self.config.default_ttl());
        let entry_key = self.entry_key(key);

        let is_new = match self.store.exists(std::slice::from_ref(&entry_key)).await {
            Ok(present) => !present.first().copied().unwrap_or(false),
            Err(err) => {
                self.report_store_error("set", key, &err);
                true
            }
        };
        if is_new {
            self.enforce_capacity().await;
        }

        let batch = Batch::new()
            .set(entry_key, bytes, ttl)
            .zadd(self.recency_index.as_ref(), self.clock.now_ms(), key);
        match self.store.execute_atomic(batch).await {
            Ok(_) => debug!(target: TARGET, op = "set", key, ttl_secs = ttl.as_secs(), "cached"),
            Err(err) => self.report_store_error("set", key, &err),
        }
    }

    /// Delete every entry whose key starts with `prefix`; returns how many keys
    /// were dropped from the cache or its index.
    pub async fn invalidate(&self, prefix: &str) -> usize {
        let entry_keys = match self.store.scan_prefix(&self.entry_key(prefix)).await {
            Ok(keys) => keys,
            Err(err) => {
                self.report_store_error("invalidate", prefix, &err);
                return 0;
            }
        };

        let mut keys: BTreeSet<String> = entry_keys
            .iter()
            .map(|entry_key| self.cache_key(entry_key).to_string())
            .collect();

        // The index is bounded by `max_entries`, so a full read stays cheap and
        // also catches members whose entries already expired.
        match self.store.zrange(&self.recency_index, 0, -1).await {
            Ok(members) => keys.extend(
                members
                    .into_iter()
                    .map(|scored| scored.member)
                    .filter(|member| member.starts_with(prefix)),
            ),
            Err(err) => self.report_store_error("invalidate", prefix, &err),
        }

        if keys.is_empty() {
            return 0;
        }

        let removed = keys.len();
        self.remove_keys(keys.into_iter().collect()).await;
        debug!(target: TARGET, op = "invalidate", prefix, removed, "invalidated");
        removed
    }

    /// Delete every entry and the recency index.
    pub async fn clear(&self) {
        let mut keys = match self.store.scan_prefix(&self.entry_prefix).await {
            Ok(keys) => keys,
            Err(err) => {
                self.report_store_error("clear", "*", &err);
                return;
            }
        };
        keys.push(self.recency_index.to_string());
        if let Err(err) = self.store.delete(&keys).await {
            self.report_store_error("clear", "*", &err);
            return;
        }
        debug!(target: TARGET, op = "clear", removed = keys.len() - 1, "cache cleared");
    }

    /// Evict the least recently used share of entries once the live count
    /// reaches `max_entries`. Returns the number of entries evicted.
    pub async fn enforce_capacity(&self) -> usize {
        let live = match self.store.zcard(&self.recency_index).await {
            Ok(count) => count,
            Err(err) => {
                self.report_store_error("enforce_capacity", "*", &err);
                return 0;
            }
        };
        if live < self.config.max_entries.get() as u64 {
            return 0;
        }

        let quota = self.config.eviction_quota(live);
        let mut victims = Vec::with_capacity(quota);
        let mut stale = Vec::new();
        let mut offset: isize = 0;

        while victims.len() < quota {
            let wanted = (quota - victims.len()) as isize;
            let candidates = match self
                .store
                .zrange(&self.recency_index, offset, offset + wanted - 1)
                .await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    self.report_store_error("enforce_capacity", "*", &err);
                    break;
                }
            };
            if candidates.is_empty() {
                break;
            }
            offset += candidates.len() as isize;

            let entry_keys: Vec<String> = candidates
                .iter()
                .map(|scored| self.entry_key(&scored.member))
                .collect();
            let present = match self.store.exists(&entry_keys).await {
                Ok(present) => present,
                Err(err) => {
                    self.report_store_error("enforce_capacity", "*", &err);
                    break;
                }
            };

            for (scored, present) in candidates.into_iter().zip(present) {
                if present {
                    victims.push(scored.member);
                } else {
                    stale.push(scored.member);
                }
            }
        }

        if victims.is_empty() && stale.is_empty() {
            return 0;
        }

        let evicted = victims.len();
        let pruned = stale.len();
        let entry_keys = victims.iter().map(|key| self.entry_key(key)).collect();
        let mut members = victims;
        members.extend(stale);
        let batch = Batch::new()
            .delete(entry_keys)
            .zrem(self.recency_index.as_ref(), members);

        match self.store.execute_atomic(batch).await {
            Ok(_) => {
                counter!("soffio_guard_cache_evict_total").increment(evicted as u64);
                debug!(
                    target: TARGET,
                    op = "enforce_capacity",
                    live,
                    evicted,
                    pruned,
                    "evicted least recently used entries"
                );
                evicted
            }
            Err(err) => {
                self.report_store_error("enforce_capacity", "*", &err);
                0
            }
        }
    }

    /// Number of members in the recency index (upper bound on live entries).
    pub async fn entry_count(&self) -> Result<u64, StoreError> {
        self.store.zcard(&self.recency_index).await
    }

    async fn touch(&self, key: &str) {
        let batch = Batch::new().zadd(self.recency_index.as_ref(), self.clock.now_ms(), key);
        if let Err(err) = self.store.execute_atomic(batch).await {
            self.report_store_error("touch", key, &err);
        }
    }

    async fn remove_keys(&self, keys: Vec<String>) {
        let entry_keys = keys.iter().map(|key| self.entry_key(key)).collect();
        let batch = Batch::new()
            .delete(entry_keys)
            .zrem(self.recency_index.as_ref(), keys);
        if let Err(err) = self.store.execute_atomic(batch).await {
            self.report_store_error("remove", "*", &err);
        }
    }

    fn report_store_error(&self, op: &'static str, key: &str, err: &StoreError) {
        counter!("soffio_guard_cache_store_error_total").increment(1);
        warn!(
            target: TARGET,
            op,
            key,
            error = %err,
            "cache store unavailable; failing open"
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    use super::*;

    fn cache(max_entries: usize) -> (CacheStore, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = CacheConfig {
            max_entries: std::num::NonZeroUsize::new(max_entries).expect("non-zero"),
            ..Default::default()
        };
        (
            CacheStore::new(store.clone(), clock.clone(), config),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn get_refreshes_recency() {
        let (cache, store, clock) = cache(10);
        cache.set("a", &1u32, None).await;
        clock.advance_ms(500);
        assert_eq!(cache.get::<u32>("a").await, Some(1));

        let index = store
            .zrange(&cache.config().recency_index(), 0, -1)
            .await
            .expect("index");
        assert_eq!(index[0].score, 1_000_500);
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss_and_is_dropped() {
        let (cache, _, _) = cache(10);
        cache.set_raw("bad", b"not json".to_vec(), None).await;
        assert_eq!(cache.get::<u32>("bad").await, None);
        assert_eq!(cache.entry_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn unserializable_value_is_skipped() {
        use std::collections::HashMap;

        let (cache, _, _) = cache(10);
        // Non-string map keys cannot be encoded as JSON.
        let mut value = HashMap::new();
        value.insert((1u8, 2u8), "x");
        cache.set("tuple-keys", &value, None).await;
        assert_eq!(cache.entry_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn zero_ttl_falls_back_to_default() {
        let (cache, _, clock) = cache(10);
        cache.set("k", &"v", Some(Duration::ZERO)).await;
        clock.advance_ms(299_000);
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
    }
}
