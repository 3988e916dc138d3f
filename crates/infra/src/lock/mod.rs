//! Distributed lock: cross-instance mutual exclusion with TTL supersession.
//!
//! Two interchangeable backends implement [`DistributedLock`]:
//!
//! - [`CacheLock`] over an atomic "set if absent with TTL" cache primitive
//!   (Redis in production, [`InMemoryLockCache`] in tests)
//! - [`RelationalLock`] over a lock table (Postgres `event_lock`, or
//!   [`InMemoryLockTable`]), which steals rows older than the TTL
//!
//! The deployment picks one once, via [`connect_lock`]; callers only ever see
//! `Arc<dyn DistributedLock>`.

pub mod cache;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod relational;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use rowqueue_core::TenantId;

use crate::config::LockBackend;
use crate::error::LockError;

pub use cache::{CacheLock, InMemoryLockCache, LockCache};
pub use postgres::PostgresLockTable;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockCache;
pub use relational::{InMemoryLockTable, LockTable, RelationalLock};

/// Value stored by plain `acquire`.
pub const LOCK_VALUE: &str = "true";

/// Namespace of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Tenant(TenantId),
    /// Shared by all tenants (run coordination).
    Global,
}

/// A lock name qualified by its scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    scope: LockScope,
    name: String,
}

impl LockKey {
    pub fn tenant(tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            scope: LockScope::Tenant(tenant_id),
            name: name.into(),
        }
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self {
            scope: LockScope::Global,
            name: name.into(),
        }
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend key: `tenant##name`, or just `name` when global.
    pub fn code(&self) -> String {
        match self.scope {
            LockScope::Tenant(tenant_id) => format!("{}##{}", tenant_id, self.name),
            LockScope::Global => self.name.clone(),
        }
    }
}

impl core::fmt::Display for LockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.code())
    }
}

/// Distributed lock abstraction.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock for `ttl`. `false` means someone else holds it.
    async fn acquire(&self, key: &LockKey, ttl: Duration) -> Result<bool, LockError> {
        self.set_value_with_expire(key, LOCK_VALUE, ttl).await
    }

    async fn release(&self, key: &LockKey) -> Result<(), LockError>;

    /// Store `value` unless a live value exists. First writer wins.
    async fn set_value_with_expire(
        &self,
        key: &LockKey,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Current value, if any.
    async fn check_value(&self, key: &LockKey) -> Result<Option<String>, LockError>;
}

/// Build the deployment's lock from the configured backend.
pub async fn connect_lock(
    backend: LockBackend,
    pool: &PgPool,
    redis_url: Option<&str>,
) -> Result<Arc<dyn DistributedLock>, LockError> {
    match backend {
        LockBackend::Database => Ok(Arc::new(RelationalLock::new(PostgresLockTable::new(
            pool.clone(),
        )))),
        LockBackend::Redis => connect_redis(redis_url).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(redis_url: Option<&str>) -> Result<Arc<dyn DistributedLock>, LockError> {
    let url = redis_url.ok_or_else(|| LockError::Cache("redis lock backend needs a url".to_string()))?;
    let cache = RedisLockCache::connect(url).await?;
    Ok(Arc::new(CacheLock::new(cache)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_redis_url: Option<&str>) -> Result<Arc<dyn DistributedLock>, LockError> {
    Err(LockError::Cache(
        "redis lock backend requested but the `redis` feature is disabled".to_string(),
    ))
}
