//! Postgres lock table (`event_lock`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use rowqueue_core::now_micros;

use super::LockTable;
use crate::error::LockError;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS event_lock (
        code TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

#[derive(Debug, Clone)]
pub struct PostgresLockTable {
    pool: Arc<PgPool>,
}

impl PostgresLockTable {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), LockError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl LockTable for PostgresLockTable {
    #[instrument(skip(self, value), err)]
    async fn try_insert(&self, code: &str, value: &str) -> Result<bool, LockError> {
        let inserted = sqlx::query("INSERT INTO event_lock (code, value, created_at) VALUES ($1, $2, $3)")
            .bind(code)
            .bind(value)
            .bind(now_micros())
            .execute(&*self.pool)
            .await;

        match inserted {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(map_sqlx_error("try_insert", e)),
        }
    }

    #[instrument(skip(self, value), err)]
    async fn replace_if_older(
        &self,
        code: &str,
        value: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("replace_if_older", e))?;

        let row = sqlx::query("SELECT created_at FROM event_lock WHERE code = $1 FOR UPDATE")
            .bind(code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_if_older", e))?;

        let statement = match row {
            Some(row) => {
                let created_at: DateTime<Utc> = row
                    .try_get("created_at")
                    .map_err(|e| map_sqlx_error("replace_if_older", e))?;
                if created_at > cutoff {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("replace_if_older", e))?;
                    return Ok(false);
                }
                "UPDATE event_lock SET value = $2, created_at = $3 WHERE code = $1"
            }
            // Released between our insert attempt and this read.
            None => {
                "INSERT INTO event_lock (code, value, created_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (code) DO NOTHING"
            }
        };

        let written = sqlx::query(statement)
            .bind(code)
            .bind(value)
            .bind(now_micros())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_if_older", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("replace_if_older", e))?;
        Ok(written.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, code: &str) -> Result<Option<String>, LockError> {
        let row = sqlx::query("SELECT value FROM event_lock WHERE code = $1")
            .bind(code)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|row| row.try_get("value"))
            .transpose()
            .map_err(|e| map_sqlx_error("get", e))
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, code: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM event_lock WHERE code = $1")
            .bind(code)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    LockError::Database(format!("sqlx error in {}: {}", operation, err))
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
