//! Redis backend for the shared ephemeral store.
//!
//! Atomic batches are sent as `MULTI/EXEC` pipelines. Every call, including
//! acquiring a pooled connection, is bounded by the configured timeout so a
//! degraded Redis surfaces as [`StoreError`] instead of stalling requests.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime, Timeouts};
use redis::{AsyncCommands, RedisError, Value};
use tracing::debug;

use super::{Batch, EphemeralStore, Reply, ScoredMember, StoreError, StoreOp};

const SCAN_COUNT: usize = 200;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    pub pool_size: usize,
    pub timeout: Duration,
}

pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
}

impl RedisStore {
    /// Build the connection pool. No connection is opened until first use.
    pub fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let mut timeouts = Timeouts::default();
        timeouts.wait = Some(config.timeout);
        timeouts.create = Some(config.timeout);
        timeouts.recycle = Some(config.timeout);

        let mut pool_config = PoolConfig::default();
        pool_config.max_size = config.pool_size.max(1);
        pool_config.timeouts = timeouts;

        let mut redis_config = Config::from_url(&config.url);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| StoreError::unavailable(format!("failed to create pool: {err}")))?;

        Ok(Self {
            pool,
            timeout: config.timeout,
        })
    }

    async fn connection(&self, op: &'static str) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|err| StoreError::unavailable(format!("{op}: {err}")))
    }

    async fn bounded<T>(
        &self,
        work: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

fn redis_error(op: &'static str, err: RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::unavailable(format!("{op}: timed out: {err}"))
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::unavailable(format!("{op}: {err}"))
    } else {
        StoreError::protocol(format!("{op}: {err}"))
    }
}

/// Escape glob metacharacters so `SCAN MATCH` treats `prefix` literally.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('*');
    escaped
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[derive(Debug, Clone, Copy)]
enum ReplyShape {
    Ok,
    Int,
    Members,
}

fn decode_reply(shape: ReplyShape, value: &Value) -> Result<Reply, StoreError> {
    match shape {
        ReplyShape::Ok => Ok(Reply::Ok),
        ReplyShape::Int => redis::from_redis_value::<i64>(value)
            .map(Reply::Int)
            .map_err(|err| redis_error("execute_atomic", err)),
        ReplyShape::Members => redis::from_redis_value::<Vec<(String, f64)>>(value)
            .map(|pairs| Reply::Members(to_scored(pairs)))
            .map_err(|err| redis_error("execute_atomic", err)),
    }
}

fn to_scored(pairs: Vec<(String, f64)>) -> Vec<ScoredMember> {
    pairs
        .into_iter()
        .map(|(member, score)| ScoredMember {
            member,
            score: score as i64,
        })
        .collect()
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.bounded(async {
            let mut conn = self.connection("get").await?;
            conn.get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(|err| redis_error("get", err))
        })
        .await
    }

    async fn exists(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.bounded(async {
            let mut conn = self.connection("exists").await?;
            let mut pipe = redis::pipe();
            for key in keys {
                pipe.exists(key);
            }
            pipe.query_async::<Vec<bool>>(&mut conn)
                .await
                .map_err(|err| redis_error("exists", err))
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = escape_glob(prefix);
        self.bounded(async {
            let mut conn = self.connection("scan_prefix").await?;
            // SCAN may repeat keys across iterations.
            let mut keys = BTreeSet::new();
            let mut cursor = 0u64;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| redis_error("scan_prefix", err))?;
                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            debug!(target: "soffio_guard::store", prefix, matched = keys.len(), "scan complete");
            Ok(keys.into_iter().collect())
        })
        .await
    }

    async fn zcard(&self, set: &str) -> Result<u64, StoreError> {
        self.bounded(async {
            let mut conn = self.connection("zcard").await?;
            conn.zcard::<_, u64>(set)
                .await
                .map_err(|err| redis_error("zcard", err))
        })
        .await
    }

    async fn zrange(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        self.bounded(async {
            let mut conn = self.connection("zrange").await?;
            conn.zrange_withscores::<_, Vec<(String, f64)>>(set, start, stop)
                .await
                .map(to_scored)
                .map_err(|err| redis_error("zrange", err))
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(async {
            let mut conn = self.connection("ping").await?;
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map(|_| ())
                .map_err(|err| redis_error("ping", err))
        })
        .await
    }

    async fn execute_atomic(&self, batch: Batch) -> Result<Vec<Reply>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut shapes = Vec::with_capacity(batch.len());
        for op in batch.into_ops() {
            let shape = match op {
                StoreOp::Set { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(ttl_millis(ttl));
                    ReplyShape::Ok
                }
                StoreOp::Delete { keys } => {
                    pipe.del(keys);
                    ReplyShape::Int
                }
                StoreOp::ZAdd { set, score, member } => {
                    pipe.zadd(set, member, score);
                    ReplyShape::Int
                }
                StoreOp::ZRem { set, members } => {
                    pipe.zrem(set, members);
                    ReplyShape::Int
                }
                StoreOp::ZRemRangeByScore { set, min, max } => {
                    pipe.zrembyscore(set, min, max);
                    ReplyShape::Int
                }
                StoreOp::ZCard { set } => {
                    pipe.zcard(set);
                    ReplyShape::Int
                }
                StoreOp::ZRange { set, start, stop } => {
                    pipe.zrange_withscores(set, start, stop);
                    ReplyShape::Members
                }
                StoreOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl));
                    ReplyShape::Int
                }
            };
            shapes.push(shape);
        }

        self.bounded(async {
            let mut conn = self.connection("execute_atomic").await?;
            let values: Vec<Value> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|err| redis_error("execute_atomic", err))?;
            if values.len() != shapes.len() {
                return Err(StoreError::protocol(format!(
                    "execute_atomic: expected {} replies, got {}",
                    shapes.len(),
                    values.len()
                )));
            }
            shapes
                .iter()
                .zip(values.iter())
                .map(|(shape, value)| decode_reply(*shape, value))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_glob_quotes_metacharacters() {
        assert_eq!(escape_glob("cache:posts:"), "cache:posts:*");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
    }

    #[test]
    fn decodes_flat_withscores_reply() {
        let value = Value::Array(vec![
            Value::BulkString(b"a".to_vec()),
            Value::BulkString(b"1700000000000".to_vec()),
            Value::BulkString(b"b".to_vec()),
            Value::BulkString(b"1700000000500".to_vec()),
        ]);
        let reply = decode_reply(ReplyShape::Members, &value).expect("members");
        assert_eq!(
            reply,
            Reply::Members(vec![
                ScoredMember {
                    member: "a".to_string(),
                    score: 1_700_000_000_000,
                },
                ScoredMember {
                    member: "b".to_string(),
                    score: 1_700_000_000_500,
                },
            ])
        );
    }
}
