//! Postgres-backed queue store.
//!
//! Rows live in `event_queue`, scoped by `tenant_id`. Selection and lease
//! checks use `SELECT ... FOR UPDATE` with a transaction-local
//! `lock_timeout`, so a contended table yields a bounded wait instead of a
//! stuck tick.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (lock not available) | `55P03` | `LockTimeout` | Row locks held by another instance past the wait bound |
//! | Database (unique violation) | `23505` | `Conflict` | Producer re-inserted an existing id |
//! | Database (other) | Any other | `Database` | Other database errors |
//! | PoolClosed | N/A | `Database` | Connection pool was closed |
//! | Other | N/A | `Database` | Network errors, decoding failures, etc. |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use rowqueue_core::{EntryId, EntryStatus, NewEntry, QueueEntry, TenantId, now_micros};

use super::{LeaseCheck, QueueStore, SelectQuery, Selection, StatusBatch};
use crate::error::StoreError;

/// Wait applied by statements that carry no explicit bound.
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS event_queue (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        type TEXT NOT NULL,
        sub_type TEXT NOT NULL,
        payload TEXT,
        status SMALLINT NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_attempt_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS event_queue_due_idx
        ON event_queue (tenant_id, type, sub_type, status, created_at, id)
    "#,
];

/// Postgres-backed queue store.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the queue table and its selection index if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", DEFAULT_LOCK_WAIT, e))?;
        }
        Ok(())
    }

    async fn begin(
        &self,
        operation: &str,
        lock_wait: Duration,
    ) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, lock_wait, e))?;
        set_lock_timeout(&mut tx, lock_wait)
            .await
            .map_err(|e| map_sqlx_error(operation, lock_wait, e))?;
        Ok(tx)
    }
}

/// Bound row-lock waits for the rest of the transaction.
pub(crate) async fn set_lock_timeout(
    tx: &mut Transaction<'_, Postgres>,
    wait: Duration,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", wait.as_millis().max(1)))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn to_uuids(ids: &[EntryId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, entries), fields(entry_count = entries.len()), err)]
    async fn enqueue(&self, entries: Vec<NewEntry>) -> Result<Vec<EntryId>, StoreError> {
        let mut tx = self.begin("enqueue", DEFAULT_LOCK_WAIT).await?;
        let now = now_micros();
        let mut ids = Vec::with_capacity(entries.len());

        for new_entry in entries {
            let entry = new_entry.into_entry(now)?;
            sqlx::query(
                r#"
                INSERT INTO event_queue (
                    id, tenant_id, type, sub_type, payload, status, attempts, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.id.as_uuid())
            .bind(entry.tenant_id.as_uuid())
            .bind(&entry.event_type)
            .bind(&entry.sub_type)
            .bind(&entry.payload)
            .bind(entry.status.code())
            .bind(0_i32)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue", DEFAULT_LOCK_WAIT, e))?;
            ids.push(entry.id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("enqueue", DEFAULT_LOCK_WAIT, e))?;
        Ok(ids)
    }

    #[instrument(
        skip(self, query),
        fields(tenant_id = %tenant_id, event = %query.key, limit = query.limit),
        err
    )]
    async fn select_due(
        &self,
        tenant_id: TenantId,
        query: &SelectQuery,
    ) -> Result<Selection, StoreError> {
        let wait = query.lock_wait;
        let mut tx = self.begin("select_due", wait).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, type, sub_type, payload, status, attempts,
                   created_at, last_attempt_at
            FROM event_queue
            WHERE tenant_id = $1 AND type = $2 AND sub_type = $3
              AND (
                    status = $4
                 OR (status = $5 AND (last_attempt_at IS NULL OR last_attempt_at <= $6))
                 OR (status = $7 AND (last_attempt_at IS NULL OR last_attempt_at <= $8))
              )
            ORDER BY created_at ASC, id ASC
            LIMIT $9
            FOR UPDATE
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&query.key.event_type)
        .bind(&query.key.sub_type)
        .bind(EntryStatus::Open.code())
        .bind(EntryStatus::Error.code())
        .bind(query.tick_start)
        .bind(EntryStatus::InProgress.code())
        .bind(query.orphan_cutoff)
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_due", wait, e))?;

        let mut selection = Selection::default();
        for row in rows {
            let entry = QueueRow::from_row(&row)
                .map_err(|e| StoreError::Serialization(format!("failed to decode queue row: {e}")))?
                .into_entry()?;
            if entry.attempts >= query.retry_limit {
                selection.exceeded.push(entry);
            } else {
                selection.due.push(entry);
            }
        }

        if !selection.due.is_empty() {
            let now = now_micros();
            let ids: Vec<Uuid> = selection.due.iter().map(|e| *e.id.as_uuid()).collect();
            sqlx::query(
                r#"
                UPDATE event_queue
                SET status = $1, attempts = attempts + 1, last_attempt_at = $2
                WHERE tenant_id = $3 AND id = ANY($4)
                "#,
            )
            .bind(EntryStatus::InProgress.code())
            .bind(now)
            .bind(tenant_id.as_uuid())
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_due", wait, e))?;

            for entry in &mut selection.due {
                entry.status = EntryStatus::InProgress;
                entry.attempts += 1;
                entry.last_attempt_at = Some(now);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("select_due", wait, e))?;
        Ok(selection)
    }

    #[instrument(skip(self, ids), fields(tenant_id = %tenant_id, entry_count = ids.len()), err)]
    async fn mark_exceeded(&self, tenant_id: TenantId, ids: &[EntryId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE event_queue SET status = $1 WHERE tenant_id = $2 AND id = ANY($3)")
            .bind(EntryStatus::Exceeded.code())
            .bind(tenant_id.as_uuid())
            .bind(to_uuids(ids))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_exceeded", DEFAULT_LOCK_WAIT, e))?;
        Ok(())
    }

    #[instrument(skip(self, expected), fields(tenant_id = %tenant_id, entry_count = expected.len()), err)]
    async fn keepalive(
        &self,
        tenant_id: TenantId,
        expected: &[(EntryId, DateTime<Utc>)],
        lock_wait: Duration,
    ) -> Result<LeaseCheck, StoreError> {
        let ids: Vec<Uuid> = expected.iter().map(|(id, _)| *id.as_uuid()).collect();
        let mut tx = self.begin("keepalive", lock_wait).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, last_attempt_at
            FROM event_queue
            WHERE tenant_id = $1 AND id = ANY($2)
            FOR UPDATE
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("keepalive", lock_wait, e))?;

        for row in &rows {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let stored: Option<DateTime<Utc>> = row
                .try_get("last_attempt_at")
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let remembered = expected
                .iter()
                .find(|(expected_id, _)| expected_id.as_uuid() == &id)
                .map(|(_, ts)| *ts);
            if stored != remembered {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("keepalive", lock_wait, e))?;
                return Ok(LeaseCheck::Modified);
            }
        }

        let now = now_micros();
        sqlx::query("UPDATE event_queue SET last_attempt_at = $1 WHERE tenant_id = $2 AND id = ANY($3)")
            .bind(now)
            .bind(tenant_id.as_uuid())
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("keepalive", lock_wait, e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("keepalive", lock_wait, e))?;
        Ok(LeaseCheck::Extended(now))
    }

    #[instrument(
        skip(self, batch),
        fields(
            tenant_id = %tenant_id,
            requeued = batch.requeued.len(),
            done = batch.done.len(),
            failed = batch.failed.len()
        ),
        err
    )]
    async fn persist_statuses(
        &self,
        tenant_id: TenantId,
        batch: &StatusBatch,
    ) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.begin("persist_statuses", DEFAULT_LOCK_WAIT).await?;
        let now = now_micros();

        if !batch.requeued.is_empty() {
            sqlx::query(
                r#"
                UPDATE event_queue
                SET status = $1, attempts = GREATEST(attempts - 1, 0), last_attempt_at = $2
                WHERE tenant_id = $3 AND id = ANY($4)
                "#,
            )
            .bind(EntryStatus::Open.code())
            .bind(now)
            .bind(tenant_id.as_uuid())
            .bind(to_uuids(&batch.requeued))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("persist_statuses", DEFAULT_LOCK_WAIT, e))?;
        }

        for (ids, status) in [(&batch.done, EntryStatus::Done), (&batch.failed, EntryStatus::Error)] {
            if ids.is_empty() {
                continue;
            }
            sqlx::query(
                r#"
                UPDATE event_queue
                SET status = $1, last_attempt_at = $2
                WHERE tenant_id = $3 AND id = ANY($4)
                "#,
            )
            .bind(status.code())
            .bind(now)
            .bind(tenant_id.as_uuid())
            .bind(to_uuids(ids))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("persist_statuses", DEFAULT_LOCK_WAIT, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("persist_statuses", DEFAULT_LOCK_WAIT, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %id), err)]
    async fn get(&self, tenant_id: TenantId, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, type, sub_type, payload, status, attempts,
                   created_at, last_attempt_at
            FROM event_queue
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", DEFAULT_LOCK_WAIT, e))?;

        row.map(|row| {
            QueueRow::from_row(&row)
                .map_err(|e| StoreError::Serialization(format!("failed to decode queue row: {e}")))?
                .into_entry()
        })
        .transpose()
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, lock_wait: Duration, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") => StoreError::LockTimeout(lock_wait),
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct QueueRow {
    id: Uuid,
    tenant_id: Uuid,
    event_type: String,
    sub_type: String,
    payload: Option<String>,
    status: i16,
    attempts: i32,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for QueueRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_type: row.try_get("type")?,
            sub_type: row.try_get("sub_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
        })
    }
}

impl QueueRow {
    fn into_entry(self) -> Result<QueueEntry, StoreError> {
        let attempts = u32::try_from(self.attempts).map_err(|_| {
            StoreError::Serialization(format!("negative attempts on entry {}", self.id))
        })?;
        Ok(QueueEntry {
            id: EntryId::from_uuid(self.id),
            tenant_id: TenantId::from_uuid(self.tenant_id),
            event_type: self.event_type,
            sub_type: self.sub_type,
            payload: self.payload,
            status: EntryStatus::from_code(self.status)?,
            attempts,
            created_at: self.created_at,
            last_attempt_at: self.last_attempt_at,
        })
    }
}
