//! Redis lock cache (`SET key value NX PX ttl`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::LockCache;
use crate::error::LockError;

/// Default key prefix for lock entries
const DEFAULT_KEY_PREFIX: &str = "rowqueue:lock:";

#[derive(Clone)]
pub struct RedisLockCache {
    conn: ConnectionManager,
    prefix: String,
}

impl core::fmt::Debug for RedisLockCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLockCache")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLockCache {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Cache(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Cache(format!("redis connection error: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl LockCache for RedisLockCache {
    #[instrument(skip(self, value), err)]
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        // PX 0 is rejected by Redis.
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Cache(format!("SET NX failed: {e}")))?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Cache(format!("GET failed: {e}")))?;
        Ok(value)
    }

    #[instrument(skip(self), err)]
    async fn del(&self, key: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Cache(format!("DEL failed: {e}")))?;
        Ok(())
    }
}
