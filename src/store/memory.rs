//! In-process keyspace with the same contract as the Redis backend.
//!
//! One mutex guards the whole keyspace, which makes every batch atomic. This
//! backend is not shared between processes and must only be used by a single
//! guard instance (local development, tests).
//!
//! Expired keys are dropped lazily when touched, and every
//! [`SWEEP_EVERY_BATCHES`] atomic batches a full sweep reclaims keys nobody
//! touches again (idle rate-limit windows, unread cache entries).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

use super::lock::mutex_lock;
use super::{Batch, EphemeralStore, Reply, ScoredMember, StoreError, StoreOp};

const SOURCE: &str = "store::memory";

/// Atomic batches between two full expiry sweeps.
const SWEEP_EVERY_BATCHES: u64 = 1_024;

#[derive(Debug)]
struct StringEntry {
    value: Vec<u8>,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
    expires_at_ms: Option<i64>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: i64) -> bool {
        let added = match self.scores.insert(member.clone(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.clone()));
                false
            }
            None => true,
        };
        self.ordered.insert((score, member));
        added
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn remove_range(&mut self, min: i64, max: i64) -> usize {
        let doomed: Vec<(i64, String)> = self
            .ordered
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .cloned()
            .collect();
        for (_, member) in &doomed {
            self.scores.remove(member);
        }
        for entry in &doomed {
            self.ordered.remove(entry);
        }
        doomed.len()
    }

    fn range(&self, start: isize, stop: isize) -> Vec<ScoredMember> {
        let len = self.ordered.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Vec::new();
        }
        self.ordered
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(score, member)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, SortedSet>,
    batches_since_sweep: u64,
}

impl Keyspace {
    /// Drop every expired or empty key. Returns how many were removed.
    fn sweep(&mut self, now_ms: i64) -> usize {
        let before = self.strings.len() + self.sets.len();
        self.strings.retain(|_, entry| entry.expires_at_ms > now_ms);
        self.sets.retain(|_, set| {
            set.len() > 0 && set.expires_at_ms.is_none_or(|at| at > now_ms)
        });
        self.batches_since_sweep = 0;
        before - (self.strings.len() + self.sets.len())
    }

    fn maybe_sweep(&mut self, now_ms: i64) {
        self.batches_since_sweep += 1;
        if self.batches_since_sweep >= SWEEP_EVERY_BATCHES {
            let removed = self.sweep(now_ms);
            if removed > 0 {
                debug!(target: "soffio_guard::store", removed, "swept expired keys");
            }
        }
    }

    fn purge_key(&mut self, key: &str, now_ms: i64) {
        if self
            .strings
            .get(key)
            .is_some_and(|entry| entry.expires_at_ms <= now_ms)
        {
            self.strings.remove(key);
        }
        let set_dead = self.sets.get(key).is_some_and(|set| {
            set.len() == 0 || set.expires_at_ms.is_some_and(|at| at <= now_ms)
        });
        if set_dead {
            self.sets.remove(key);
        }
    }

    fn contains(&mut self, key: &str, now_ms: i64) -> bool {
        self.purge_key(key, now_ms);
        self.strings.contains_key(key) || self.sets.contains_key(key)
    }

    fn apply(&mut self, op: StoreOp, now_ms: i64) -> Result<Reply, StoreError> {
        match op {
            StoreOp::Set { key, value, ttl } => {
                self.sets.remove(&key);
                self.strings.insert(
                    key,
                    StringEntry {
                        value,
                        expires_at_ms: now_ms.saturating_add(ttl.as_millis() as i64),
                    },
                );
                Ok(Reply::Ok)
            }
            StoreOp::Delete { keys } => {
                let mut removed = 0;
                for key in keys {
                    if self.contains(&key, now_ms) {
                        self.strings.remove(&key);
                        self.sets.remove(&key);
                        removed += 1;
                    }
                }
                Ok(Reply::Int(removed))
            }
            StoreOp::ZAdd { set, score, member } => {
                self.purge_key(&set, now_ms);
                if self.strings.contains_key(&set) {
                    return Err(wrong_type(&set));
                }
                let added = self.sets.entry(set).or_default().insert(member, score);
                Ok(Reply::Int(i64::from(added)))
            }
            StoreOp::ZRem { set, members } => {
                let removed = self.with_set(&set, now_ms, |zset| {
                    members.iter().filter(|member| zset.remove(member)).count()
                })?;
                self.purge_key(&set, now_ms);
                Ok(Reply::Int(removed as i64))
            }
            StoreOp::ZRemRangeByScore { set, min, max } => {
                let removed = self.with_set(&set, now_ms, |zset| zset.remove_range(min, max))?;
                self.purge_key(&set, now_ms);
                Ok(Reply::Int(removed as i64))
            }
            StoreOp::ZCard { set } => {
                let len = self.with_set(&set, now_ms, |zset| zset.len())?;
                Ok(Reply::Int(len as i64))
            }
            StoreOp::ZRange { set, start, stop } => {
                let members = self.with_set(&set, now_ms, |zset| zset.range(start, stop))?;
                Ok(Reply::Members(members))
            }
            StoreOp::Expire { key, ttl } => {
                self.purge_key(&key, now_ms);
                let expires_at = now_ms.saturating_add(ttl.as_millis() as i64);
                if let Some(entry) = self.strings.get_mut(&key) {
                    entry.expires_at_ms = expires_at;
                    Ok(Reply::Int(1))
                } else if let Some(zset) = self.sets.get_mut(&key) {
                    zset.expires_at_ms = Some(expires_at);
                    Ok(Reply::Int(1))
                } else {
                    Ok(Reply::Int(0))
                }
            }
        }
    }

    /// Runs `f` against the set at `key`, treating a missing key as an empty set.
    fn with_set<R>(
        &mut self,
        key: &str,
        now_ms: i64,
        f: impl FnOnce(&mut SortedSet) -> R,
    ) -> Result<R, StoreError> {
        self.purge_key(key, now_ms);
        if self.strings.contains_key(key) {
            return Err(wrong_type(key));
        }
        match self.sets.get_mut(key) {
            Some(zset) => Ok(f(zset)),
            None => Ok(f(&mut SortedSet::default())),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::protocol(format!(
        "WRONGTYPE operation against `{key}` holding the wrong kind of value"
    ))
}

/// Single-process [`EphemeralStore`].
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Expiry is evaluated against `clock`, so tests can age entries without sleeping.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remove a key as if the store's own TTL had expired it.
    pub fn expire_now(&self, key: &str) {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "expire_now");
        keyspace.strings.remove(key);
        keyspace.sets.remove(key);
    }

    /// Reclaim every expired key now instead of waiting for the next
    /// amortized sweep.
    pub fn sweep_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        mutex_lock(&self.keyspace, SOURCE, "sweep_expired").sweep(now_ms)
    }

    /// Keys held in memory, including expired ones not yet reclaimed.
    pub fn resident_key_count(&self) -> usize {
        let keyspace = mutex_lock(&self.keyspace, SOURCE, "resident_key_count");
        keyspace.strings.len() + keyspace.sets.len()
    }

    /// Number of live keys of any kind.
    pub fn key_count(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "key_count");
        let keys: Vec<String> = keyspace
            .strings
            .keys()
            .chain(keyspace.sets.keys())
            .cloned()
            .collect();
        keys.into_iter()
            .filter(|key| keyspace.contains(key, now_ms))
            .count()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("simulated outage"))
        }
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_available()?;
        let now_ms = self.clock.now_ms();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "get");
        keyspace.purge_key(key, now_ms);
        if keyspace.sets.contains_key(key) {
            return Err(wrong_type(key));
        }
        Ok(keyspace.strings.get(key).map(|entry| entry.value.clone()))
    }

    async fn exists(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        self.ensure_available()?;
        let now_ms = self.clock.now_ms();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "exists");
        Ok(keys
            .iter()
            .map(|key| keyspace.contains(key, now_ms))
            .collect())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        let now_ms = self.clock.now_ms();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "scan_prefix");
        let candidates: Vec<String> = keyspace
            .strings
            .keys()
            .chain(keyspace.sets.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|key| keyspace.contains(key, now_ms))
            .collect())
    }

    async fn zcard(&self, set: &str) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let now_ms = self.clock.now_ms();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "zcard");
        keyspace.with_set(set, now_ms, |zset| zset.len() as u64)
    }

    async fn zrange(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        self.ensure_available()?;
        let now_ms = self.clock.now_ms();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "zrange");
        keyspace.with_set(set, now_ms, |zset| zset.range(start, stop))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn execute_atomic(&self, batch: Batch) -> Result<Vec<Reply>, StoreError> {
        self.ensure_available()?;
        let now_ms = self.clock.now_ms();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "execute_atomic");
        keyspace.maybe_sweep(now_ms);
        batch
            .into_ops()
            .into_iter()
            .map(|op| keyspace.apply(op, now_ms))
            .collect()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::clock::ManualClock;

    use super::*;

    fn store_at(start_ms: i64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn string_expires_with_clock() {
        let (store, clock) = store_at(0);
        store
            .set_with_expiry("k", b"v".to_vec(), Duration::from_secs(2))
            .await
            .expect("set");
        assert_eq!(store.get("k").await.expect("get"), Some(b"v".to_vec()));

        clock.advance_ms(2_001);
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn zrange_orders_by_score_then_member() {
        let (store, _) = store_at(0);
        let batch = Batch::new()
            .zadd("z", 20, "b")
            .zadd("z", 10, "c")
            .zadd("z", 20, "a");
        store.execute_atomic(batch).await.expect("zadd");

        let members = store.zrange("z", 0, -1).await.expect("range");
        let names: Vec<&str> = members.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);

        let head = store.zrange("z", 0, 0).await.expect("head");
        assert_eq!(head[0].score, 10);
    }

    #[tokio::test]
    async fn removing_last_member_deletes_set() {
        let (store, _) = store_at(0);
        store
            .execute_atomic(Batch::new().zadd("z", 1, "only"))
            .await
            .expect("zadd");
        store
            .execute_atomic(Batch::new().zrem("z", vec!["only".to_string()]))
            .await
            .expect("zrem");
        assert_eq!(
            store.exists(&["z".to_string()]).await.expect("exists"),
            vec![false]
        );
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let (store, _) = store_at(0);
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.execute_atomic(Batch::new().zcard("z")).await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn idle_windows_are_reclaimed_by_the_sweep() {
        let (store, clock) = store_at(0);
        for subject in 0..SWEEP_EVERY_BATCHES {
            let window = format!("rl:api:addr:{subject}");
            store
                .execute_atomic(
                    Batch::new()
                        .zadd(window.as_str(), 0, "m")
                        .expire(window.as_str(), Duration::from_secs(1)),
                )
                .await
                .expect("window");
        }
        assert_eq!(store.resident_key_count(), SWEEP_EVERY_BATCHES as usize);

        clock.advance_ms(3_600_000);
        for _ in 0..SWEEP_EVERY_BATCHES {
            store
                .execute_atomic(Batch::new().zadd("rl:api:addr:fresh", 0, "m"))
                .await
                .expect("window");
        }

        assert_eq!(store.resident_key_count(), 1);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn explicit_sweep_drops_unread_entries() {
        let (store, clock) = store_at(0);
        store
            .set_with_expiry("cache:a", vec![1], Duration::from_secs(1))
            .await
            .expect("set");
        store
            .set_with_expiry("cache:b", vec![2], Duration::from_secs(60))
            .await
            .expect("set");
        clock.advance_ms(2_000);

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.resident_key_count(), 1);
    }

    #[tokio::test]
    async fn scan_prefix_skips_expired_keys() {
        let (store, clock) = store_at(0);
        store
            .set_with_expiry("ns:a", vec![1], Duration::from_secs(1))
            .await
            .expect("set");
        store
            .set_with_expiry("ns:b", vec![2], Duration::from_secs(10))
            .await
            .expect("set");
        store
            .set_with_expiry("other", vec![3], Duration::from_secs(10))
            .await
            .expect("set");
        clock.advance_ms(1_500);

        let keys = store.scan_prefix("ns:").await.expect("scan");
        assert_eq!(keys, vec!["ns:b".to_string()]);
    }
}
