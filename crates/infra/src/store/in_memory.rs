//! In-memory queue store for tests/dev.
//!
//! A single async mutex stands in for the table's row locks: every
//! operation holds it for its whole "transaction", and waits on it are
//! bounded the same way row-lock waits are.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use rowqueue_core::{EntryId, EntryStatus, NewEntry, QueueEntry, TenantId, now_micros};

use super::{LeaseCheck, QueueStore, SelectQuery, Selection, StatusBatch};
use crate::error::StoreError;

type Rows = HashMap<EntryId, QueueEntry>;

/// Wait applied by operations that carry no explicit bound.
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    rows: Mutex<Rows>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    async fn lock(&self, wait: Duration) -> Result<MutexGuard<'_, Rows>, StoreError> {
        tokio::time::timeout(wait, self.rows.lock())
            .await
            .map_err(|_| StoreError::LockTimeout(wait))
    }

    /// Insert a fully formed entry as is (fixtures, data migration).
    pub async fn insert(&self, entry: QueueEntry) -> Result<EntryId, StoreError> {
        let mut rows = self.lock(DEFAULT_LOCK_WAIT).await?;
        if rows.contains_key(&entry.id) {
            return Err(StoreError::Conflict(format!("entry {} already exists", entry.id)));
        }
        let id = entry.id;
        rows.insert(id, entry);
        Ok(id)
    }

    /// All entries of a tenant, FIFO ordered.
    pub async fn snapshot(&self, tenant_id: TenantId) -> Vec<QueueEntry> {
        let rows = self.rows.lock().await;
        let mut entries: Vec<_> = rows
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        entries
    }

    /// Overwrite `last_attempt_at` as an external writer would.
    pub async fn touch(&self, id: EntryId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut rows = self.lock(DEFAULT_LOCK_WAIT).await?;
        let entry = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.last_attempt_at = Some(at);
        Ok(())
    }

    /// Hold every row lock until the guard drops.
    #[cfg(test)]
    pub(crate) async fn hold_rows(&self) -> MutexGuard<'_, Rows> {
        self.rows.lock().await
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, entries: Vec<NewEntry>) -> Result<Vec<EntryId>, StoreError> {
        let mut rows = self.lock(DEFAULT_LOCK_WAIT).await?;
        let now = now_micros();
        let mut ids = Vec::with_capacity(entries.len());
        let mut staged = Vec::with_capacity(entries.len());
        for new_entry in entries {
            let entry = new_entry.into_entry(now)?;
            ids.push(entry.id);
            staged.push(entry);
        }
        rows.extend(staged.into_iter().map(|e| (e.id, e)));
        Ok(ids)
    }

    async fn select_due(
        &self,
        tenant_id: TenantId,
        query: &SelectQuery,
    ) -> Result<Selection, StoreError> {
        let mut rows = self.lock(query.lock_wait).await?;

        let candidates: Vec<EntryId> = rows
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.has_key(&query.key)
                    && e.is_due(query.tick_start, query.orphan_cutoff)
            })
            .map(|e| (e.created_at, e.id))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .take(query.limit)
            .map(|(_, id)| id)
            .collect();

        let now = now_micros();
        let mut selection = Selection::default();
        for id in candidates {
            let Some(entry) = rows.get_mut(&id) else {
                continue;
            };
            if entry.attempts >= query.retry_limit {
                selection.exceeded.push(entry.clone());
                continue;
            }
            entry.status = EntryStatus::InProgress;
            entry.attempts += 1;
            entry.last_attempt_at = Some(now);
            selection.due.push(entry.clone());
        }
        Ok(selection)
    }

    async fn mark_exceeded(&self, tenant_id: TenantId, ids: &[EntryId]) -> Result<(), StoreError> {
        let mut rows = self.lock(DEFAULT_LOCK_WAIT).await?;
        for id in ids {
            if let Some(entry) = rows.get_mut(id).filter(|e| e.tenant_id == tenant_id) {
                entry.status = EntryStatus::Exceeded;
            }
        }
        Ok(())
    }

    async fn keepalive(
        &self,
        tenant_id: TenantId,
        expected: &[(EntryId, DateTime<Utc>)],
        lock_wait: Duration,
    ) -> Result<LeaseCheck, StoreError> {
        let mut rows = self.lock(lock_wait).await?;

        let modified = expected.iter().any(|(id, remembered)| {
            rows.get(id)
                .filter(|e| e.tenant_id == tenant_id)
                .is_some_and(|e| e.last_attempt_at != Some(*remembered))
        });
        if modified {
            return Ok(LeaseCheck::Modified);
        }

        let now = now_micros();
        for (id, _) in expected {
            if let Some(entry) = rows.get_mut(id).filter(|e| e.tenant_id == tenant_id) {
                entry.last_attempt_at = Some(now);
            }
        }
        Ok(LeaseCheck::Extended(now))
    }

    async fn persist_statuses(
        &self,
        tenant_id: TenantId,
        batch: &StatusBatch,
    ) -> Result<(), StoreError> {
        let mut rows = self.lock(DEFAULT_LOCK_WAIT).await?;
        let now = now_micros();

        let groups = [
            (&batch.requeued, EntryStatus::Open),
            (&batch.done, EntryStatus::Done),
            (&batch.failed, EntryStatus::Error),
        ];
        for (ids, status) in groups {
            for id in ids {
                let Some(entry) = rows.get_mut(id).filter(|e| e.tenant_id == tenant_id) else {
                    continue;
                };
                if status == EntryStatus::Open {
                    entry.attempts = entry.attempts.saturating_sub(1);
                }
                entry.status = status;
                entry.last_attempt_at = Some(now);
            }
        }
        Ok(())
    }

    async fn get(&self, tenant_id: TenantId, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        let rows = self.lock(DEFAULT_LOCK_WAIT).await?;
        Ok(rows.get(&id).filter(|e| e.tenant_id == tenant_id).cloned())
    }
}
