//! Shared ephemeral store contract.
//!
//! Every piece of state that must agree across guard instances (cache entries,
//! the recency index, rate-limit windows) lives behind [`EphemeralStore`]. Reads
//! are single round trips; writes are submitted as a [`Batch`] that the backend
//! applies atomically, so multi-step checks never read-modify-write across two
//! round trips.
//!
//! Backends:
//!
//! - [`RedisStore`]: shared Redis via a `deadpool-redis` pool, `MULTI/EXEC` batches
//! - [`MemoryStore`]: single-process keyspace for development and tests

mod lock;
mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::{RedisStore, RedisStoreConfig};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// A sorted-set member with its integer score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    pub member: String,
    pub score: i64,
}

/// A single write or read inside an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    Delete {
        keys: Vec<String>,
    },
    ZAdd {
        set: String,
        score: i64,
        member: String,
    },
    ZRem {
        set: String,
        members: Vec<String>,
    },
    /// Removes members whose score lies in `min..=max`.
    ZRemRangeByScore {
        set: String,
        min: i64,
        max: i64,
    },
    ZCard {
        set: String,
    },
    /// Members by rank, inclusive on both ends; negative ranks count from the end.
    ZRange {
        set: String,
        start: isize,
        stop: isize,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Result of one [`StoreOp`], in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Int(i64),
    Members(Vec<ScoredMember>),
}

impl Reply {
    pub fn as_int(&self) -> Result<i64, StoreError> {
        match self {
            Reply::Int(value) => Ok(*value),
            other => Err(StoreError::protocol(format!(
                "expected integer reply, got {other:?}"
            ))),
        }
    }

    pub fn into_members(self) -> Result<Vec<ScoredMember>, StoreError> {
        match self {
            Reply::Members(members) => Ok(members),
            other => Err(StoreError::protocol(format!(
                "expected member list reply, got {other:?}"
            ))),
        }
    }
}

/// Ordered list of operations applied as one atomic submission.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<StoreOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        self.ops.push(StoreOp::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn delete(mut self, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.ops.push(StoreOp::Delete { keys });
        }
        self
    }

    pub fn zadd(mut self, set: impl Into<String>, score: i64, member: impl Into<String>) -> Self {
        self.ops.push(StoreOp::ZAdd {
            set: set.into(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn zrem(mut self, set: impl Into<String>, members: Vec<String>) -> Self {
        if !members.is_empty() {
            self.ops.push(StoreOp::ZRem {
                set: set.into(),
                members,
            });
        }
        self
    }

    pub fn zrem_range_by_score(mut self, set: impl Into<String>, min: i64, max: i64) -> Self {
        self.ops.push(StoreOp::ZRemRangeByScore {
            set: set.into(),
            min,
            max,
        });
        self
    }

    pub fn zcard(mut self, set: impl Into<String>) -> Self {
        self.ops.push(StoreOp::ZCard { set: set.into() });
        self
    }

    pub fn zrange(mut self, set: impl Into<String>, start: isize, stop: isize) -> Self {
        self.ops.push(StoreOp::ZRange {
            set: set.into(),
            start,
            stop,
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(StoreOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Network-accessible key/value and sorted-set store with atomic batches.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Existence flags for `keys`, in order.
    async fn exists(&self, keys: &[String]) -> Result<Vec<bool>, StoreError>;

    /// All keys starting with the literal `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn zcard(&self, set: &str) -> Result<u64, StoreError>;

    async fn zrange(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Apply every operation in `batch` atomically, returning one reply per op.
    async fn execute_atomic(&self, batch: Batch) -> Result<Vec<Reply>, StoreError>;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.execute_atomic(Batch::new().set(key, value, ttl))
            .await
            .map(|_| ())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.execute_atomic(Batch::new().delete(keys.to_vec()))
            .await
            .map(|_| ())
    }
}
