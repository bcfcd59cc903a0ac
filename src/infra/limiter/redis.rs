//! Redis-backed limiter store shared by every process of a deployment.
//!
//! Pacing tokens are `SET NX PX`, the minute window is a sorted set scored by
//! call time, and day counters are `INCR` plus `EXPIREAT` at UTC midnight.
//! Conditional quota writes run as Lua scripts so the check and the write
//! cannot interleave with another process.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;

use crate::core::{LimiterStore, StoreError};

/// Limiter store over a Redis connection manager.
#[derive(Clone)]
pub struct RedisLimiterStore {
    conn: ConnectionManager,
}

impl RedisLimiterStore {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// `Unavailable` when Redis cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_redis)?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis)?;
        tracing::info!("redis limiter store connected");
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn map_redis(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

// KEYS[1] window; ARGV: cutoff, now_ms, member, max, window_ms.
const WINDOW_RECORD_IF_BELOW: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[4]) then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 1
";

// KEYS[1] counter; ARGV: max, expire_at (unix seconds).
const COUNTER_INCR_IF_BELOW: &str = r"
local count = redis.call('INCR', KEYS[1])
redis.call('EXPIREAT', KEYS[1], ARGV[2])
if count > tonumber(ARGV[1]) then
  redis.call('DECR', KEYS[1])
  return 0
end
return 1
";

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl LimiterStore for RedisLimiterStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl).max(1))
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(reply.is_some())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        // -2: missing, -1: no expiry.
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    async fn window_count(&self, key: &str, now_ms: i64, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let cutoff = now_ms.saturating_sub(i64::try_from(millis(window)).unwrap_or(i64::MAX));
        let (_, count): (i64, u64) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(count)
    }

    async fn window_record(
        &self,
        key: &str,
        now_ms: i64,
        member: &str,
        window: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cutoff = now_ms.saturating_sub(i64::try_from(millis(window)).unwrap_or(i64::MAX));
        redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(window))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis)
    }

    async fn window_record_if_below(
        &self,
        key: &str,
        now_ms: i64,
        member: &str,
        window: Duration,
        max: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let cutoff = now_ms.saturating_sub(i64::try_from(millis(window)).unwrap_or(i64::MAX));
        let added: i64 = redis::Script::new(WINDOW_RECORD_IF_BELOW)
            .key(key)
            .arg(cutoff)
            .arg(now_ms)
            .arg(member)
            .arg(max)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(added == 1)
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis)
    }

    async fn counter_get(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(value.unwrap_or(0))
    }

    async fn counter_incr(&self, key: &str, expire_at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let (count, _): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIREAT")
            .arg(key)
            .arg(expire_at.timestamp())
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(count)
    }

    async fn counter_incr_if_below(
        &self,
        key: &str,
        max: u64,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let kept: i64 = redis::Script::new(COUNTER_INCR_IF_BELOW)
            .key(key)
            .arg(max)
            .arg(expire_at.timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(kept == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(())
    }
}
