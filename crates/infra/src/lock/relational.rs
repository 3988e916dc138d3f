//! Relational fallback lock: a row per held lock, stolen once older than
//! the requested TTL.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rowqueue_core::now_micros;

use super::{DistributedLock, LockKey};
use crate::error::LockError;

/// Row operations on the lock table (`code`, `value`, `created_at`).
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Insert a fresh row. `false` on a uniqueness conflict.
    async fn try_insert(&self, code: &str, value: &str) -> Result<bool, LockError>;

    /// Under a row lock, overwrite the row if it was created at or before
    /// `cutoff`. A missing row is inserted. `true` if the caller now holds it.
    async fn replace_if_older(
        &self,
        code: &str,
        value: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, LockError>;

    async fn get(&self, code: &str) -> Result<Option<String>, LockError>;

    async fn delete(&self, code: &str) -> Result<(), LockError>;
}

/// Lock over any [`LockTable`].
#[derive(Debug)]
pub struct RelationalLock<T> {
    table: T,
}

impl<T: LockTable> RelationalLock<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }
}

#[async_trait]
impl<T: LockTable> DistributedLock for RelationalLock<T> {
    async fn release(&self, key: &LockKey) -> Result<(), LockError> {
        self.table.delete(&key.code()).await
    }

    async fn set_value_with_expire(
        &self,
        key: &LockKey,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let code = key.code();
        if self.table.try_insert(&code, value).await? {
            return Ok(true);
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = now_micros()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.table.replace_if_older(&code, value, cutoff).await
    }

    /// Returns the stored value whatever its age; expiry only matters to
    /// writers.
    async fn check_value(&self, key: &LockKey) -> Result<Option<String>, LockError> {
        self.table.get(&key.code()).await
    }
}

/// In-memory lock table for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLockTable {
    rows: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockTable for InMemoryLockTable {
    async fn try_insert(&self, code: &str, value: &str) -> Result<bool, LockError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if rows.contains_key(code) {
            return Ok(false);
        }
        rows.insert(code.to_string(), (value.to_string(), now_micros()));
        Ok(true)
    }

    async fn replace_if_older(
        &self,
        code: &str,
        value: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        match rows.get(code) {
            Some((_, created_at)) if *created_at > cutoff => Ok(false),
            _ => {
                rows.insert(code.to_string(), (value.to_string(), now_micros()));
                Ok(true)
            }
        }
    }

    async fn get(&self, code: &str) -> Result<Option<String>, LockError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(code).map(|(value, _)| value.clone()))
    }

    async fn delete(&self, code: &str) -> Result<(), LockError> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(code);
        Ok(())
    }
}
