//! Cache-backed lock: one atomic set-if-absent round trip per acquire.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{DistributedLock, LockKey};
use crate::error::LockError;

/// The three cache primitives the lock needs.
#[async_trait]
pub trait LockCache: Send + Sync {
    /// Set `key` to `value` with a TTL unless it exists. `true` if set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;

    async fn del(&self, key: &str) -> Result<(), LockError>;
}

/// Lock over any [`LockCache`]. Expiry is left entirely to the cache.
#[derive(Debug)]
pub struct CacheLock<C> {
    cache: C,
}

impl<C: LockCache> CacheLock<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<C: LockCache> DistributedLock for CacheLock<C> {
    async fn release(&self, key: &LockKey) -> Result<(), LockError> {
        self.cache.del(&key.code()).await
    }

    async fn set_value_with_expire(
        &self,
        key: &LockKey,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.cache.set_nx_px(&key.code(), value, ttl).await
    }

    async fn check_value(&self, key: &LockKey) -> Result<Option<String>, LockError> {
        self.cache.get(&key.code()).await
    }
}

/// In-memory cache for tests/dev. Expired keys are dropped lazily.
#[derive(Debug, Default)]
pub struct InMemoryLockCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockCache for InMemoryLockCache {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if entries.get(key).is_some_and(|(_, expires_at)| *expires_at > now) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<(), LockError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_values_are_not_returned() {
        let cache = InMemoryLockCache::new();
        assert!(cache.set_nx_px("k", "v", Duration::from_millis(20)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
