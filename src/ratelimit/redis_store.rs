use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;

use crate::error::StoreError;
use crate::redis_pool::RedisPool;

use super::window::{evaluate, WindowOutcome, WindowSpec, WindowStore};

/// Sliding-window check over every window, then an increment of all of them if each has
/// room. Buckets are aligned on the Redis server clock so every instance agrees on them.
/// Returns `estimate, ms_until_rollover` pairs as observed before the increment.
/// KEYS: one hash per window (`bucket`, `current`, `previous`), all sharing one hash tag.
/// ARGV: `limit, length_ms` per window, in KEYS order.
static CHECK_AND_INCREMENT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local observed = {}
local rolled = {}
local admit = true
for i = 1, #KEYS do
  local limit = tonumber(ARGV[2 * i - 1])
  local length = tonumber(ARGV[2 * i])
  local bucket = math.floor(now / length)
  local elapsed = now - bucket * length
  local stored = redis.call('HMGET', KEYS[i], 'bucket', 'current', 'previous')
  local stored_bucket = tonumber(stored[1])
  local current = tonumber(stored[2]) or 0
  local previous = tonumber(stored[3]) or 0
  if stored_bucket ~= bucket then
    if stored_bucket == bucket - 1 then
      previous = current
    else
      previous = 0
    end
    current = 0
  end
  local estimate = math.floor((previous * (length - elapsed) + length - 1) / length) + current
  if estimate + 1 > limit then
    admit = false
  end
  observed[2 * i - 1] = estimate
  observed[2 * i] = length - elapsed
  rolled[i] = {bucket, current, previous, length}
end
if admit then
  for i = 1, #KEYS do
    local w = rolled[i]
    redis.call('HSET', KEYS[i],
      'bucket', string.format('%d', w[1]),
      'current', string.format('%d', w[2] + 1),
      'previous', string.format('%d', w[3]))
    redis.call('PEXPIRE', KEYS[i], 2 * w[4])
  end
end
return observed
"#,
    )
});

/// key: redis-window-store
/// Window counters in the shared Redis deployment, evaluated in one server-side script.
pub struct RedisWindowStore {
    pool: Arc<RedisPool>,
}

impl RedisWindowStore {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn check_and_increment(&self, windows: &[WindowSpec]) -> Result<WindowOutcome, StoreError> {
        if windows.is_empty() {
            return Ok(WindowOutcome {
                allowed: true,
                windows: Vec::new(),
            });
        }

        let mut invocation = CHECK_AND_INCREMENT.prepare_invoke();
        for spec in windows {
            invocation
                .key(&spec.key)
                .arg(spec.limit)
                .arg(spec.length_ms());
        }

        let raw: Vec<i64> = self
            .pool
            .run(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;

        if raw.len() != windows.len() * 2 {
            return Err(StoreError::Rejected(format!(
                "window script returned {} values for {} windows",
                raw.len(),
                windows.len()
            )));
        }

        let observed: Vec<(u64, Duration)> = raw
            .chunks(2)
            .map(|pair| {
                (
                    pair[0].max(0) as u64,
                    Duration::from_millis(pair[1].max(0) as u64),
                )
            })
            .collect();

        Ok(evaluate(windows, &observed))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.pool.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::window::WindowKind;

    fn redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok()
    }

    #[tokio::test]
    async fn script_is_atomic_against_live_redis() {
        let Some(url) = redis_url() else {
            eprintln!("skipping redis window test because REDIS_URL is not set");
            return;
        };
        let pool = Arc::new(RedisPool::open(&url, Duration::from_secs(2)).unwrap());
        let store = RedisWindowStore::new(pool);
        let tag = uuid::Uuid::new_v4();
        let windows = vec![WindowSpec {
            kind: WindowKind::Minute,
            key: format!("test:{{{tag}}}:minute"),
            limit: 2,
            length: Duration::from_secs(60),
        }];

        assert!(store.check_and_increment(&windows).await.unwrap().allowed);
        assert!(store.check_and_increment(&windows).await.unwrap().allowed);
        let denied = store.check_and_increment(&windows).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.windows[0].count, 2);
        assert!(denied.windows[0].reset_after <= Duration::from_secs(60));
    }
}
