use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::redis_pool::RedisPool;

/// key: rotation-concurrency-gate
/// Cluster-wide cap on simultaneously running rotations. Slots are leases so a crashed
/// holder frees its slot once the lease lapses; holders renew while they work.
#[async_trait]
pub trait ConcurrencyGate: Send + Sync {
    /// Takes (or renews) a slot for `holder`. `false` means all `capacity` slots are held.
    async fn try_acquire(&self, holder: &str, capacity: u32, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn release(&self, holder: &str) -> Result<(), StoreError>;

    /// Unexpired slots currently held.
    async fn in_use(&self) -> Result<u32, StoreError>;
}

/// Lease expiry uses the Redis server clock so instances with skewed clocks agree.
/// KEYS[1]: slot set. ARGV: holder, capacity, ttl_ms.
static ACQUIRE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local ttl = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[2]) then
    return 0
  end
end
redis.call('ZADD', KEYS[1], now + ttl, ARGV[1])
redis.call('PEXPIRE', KEYS[1], ttl)
return 1
"#,
    )
});

static IN_USE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
return redis.call('ZCOUNT', KEYS[1], '(' .. now, '+inf')
"#,
    )
});

pub struct RedisConcurrencyGate {
    pool: Arc<RedisPool>,
    key: String,
}

impl RedisConcurrencyGate {
    pub fn new(pool: Arc<RedisPool>, prefix: &str) -> Self {
        Self {
            pool,
            key: format!("{prefix}:rotation:slots"),
        }
    }
}

#[async_trait]
impl ConcurrencyGate for RedisConcurrencyGate {
    async fn try_acquire(
        &self,
        holder: &str,
        capacity: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut invocation = ACQUIRE.prepare_invoke();
        invocation
            .key(&self.key)
            .arg(holder)
            .arg(capacity)
            .arg(ttl.as_millis() as u64);
        let granted: i64 = self
            .pool
            .run(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(granted == 1)
    }

    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        let key = self.key.clone();
        let holder = holder.to_string();
        self.pool
            .run(|mut conn| async move {
                redis::cmd("ZREM")
                    .arg(&key)
                    .arg(&holder)
                    .query_async::<_, i64>(&mut conn)
                    .await
            })
            .await
            .map(|_| ())
    }

    async fn in_use(&self) -> Result<u32, StoreError> {
        let mut invocation = IN_USE.prepare_invoke();
        invocation.key(&self.key);
        let count: i64 = self
            .pool
            .run(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(count.max(0) as u32)
    }
}

/// Gate for a single scheduler instance.
#[derive(Default)]
pub struct MemoryConcurrencyGate {
    leases: Mutex<HashMap<String, Instant>>,
}

impl MemoryConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConcurrencyGate for MemoryConcurrencyGate {
    async fn try_acquire(
        &self,
        holder: &str,
        capacity: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        leases.retain(|_, expires_at| *expires_at > now);
        if !leases.contains_key(holder) && leases.len() as u32 >= capacity {
            return Ok(false);
        }
        leases.insert(holder.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        self.leases.lock().await.remove(holder);
        Ok(())
    }

    async fn in_use(&self) -> Result<u32, StoreError> {
        let now = Instant::now();
        Ok(self
            .leases
            .lock()
            .await
            .values()
            .filter(|expires_at| **expires_at > now)
            .count() as u32)
    }
}
