use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use crate::error::StoreError;

/// key: shared-redis
/// Lazily connected, reconnecting handle to the Redis deployment shared by every instance.
/// Each call is bounded by `timeout`; the timeout surfaces as a transient [`StoreError`].
pub struct RedisPool {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl RedisPool {
    pub fn open(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|err| StoreError::Rejected(format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                match tokio::time::timeout(
                    self.timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                {
                    Ok(result) => result.map_err(StoreError::from),
                    Err(_) => Err(StoreError::Timeout(self.timeout)),
                }
            })
            .await?;
        Ok(manager.clone())
    }

    /// Runs `op` against a pooled connection under the configured timeout.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.timeout, op(conn)).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.run(|mut conn| async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }
}
