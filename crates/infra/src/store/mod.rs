//! Queue store: the table of entries the engine selects from and writes
//! statuses back to.
//!
//! Every method runs in its own short transaction, separate from any
//! business transaction a handler holds, so long-running handler logic never
//! keeps the row locks that guard selection.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rowqueue_core::{EntryId, EntryStatus, EventKey, NewEntry, QueueEntry, StatusMap, TenantId};

use crate::error::StoreError;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;

/// Parameters of one selection.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub key: EventKey,
    pub limit: usize,
    /// Entries whose stored `attempts` reached this are routed to
    /// exceeded handling instead of being stamped.
    pub retry_limit: u32,
    /// `Error` entries last attempted at or before this are due again.
    pub tick_start: DateTime<Utc>,
    /// `InProgress` entries last attempted at or before this are orphans.
    pub orphan_cutoff: DateTime<Utc>,
    /// Bounded wait for the row locks.
    pub lock_wait: Duration,
}

/// Result of one selection.
///
/// `due` entries are already stamped `InProgress` with `attempts + 1`;
/// `exceeded` entries were locked but left untouched.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub due: Vec<QueueEntry>,
    pub exceeded: Vec<QueueEntry>,
}

impl Selection {
    /// Rows matched by the selection, exceeded ones included.
    pub fn len(&self) -> usize {
        self.due.len() + self.exceeded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty() && self.exceeded.is_empty()
    }
}

/// Outcome of a lease check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeaseCheck {
    /// Nobody touched the rows; their lease now runs from this timestamp.
    Extended(DateTime<Utc>),
    /// At least one row changed since it was remembered.
    Modified,
}

/// Final statuses of one persistence step, partitioned by verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusBatch {
    /// Back to `Open`, giving back the attempt consumed at selection.
    pub requeued: Vec<EntryId>,
    pub done: Vec<EntryId>,
    pub failed: Vec<EntryId>,
}

impl StatusBatch {
    /// Partition a verdict map. Statuses a handler may not report are skipped.
    pub fn from_map(map: &StatusMap) -> Self {
        let mut batch = Self::default();
        for (id, status) in map.iter() {
            match status {
                EntryStatus::Open => batch.requeued.push(*id),
                EntryStatus::Done => batch.done.push(*id),
                EntryStatus::Error => batch.failed.push(*id),
                EntryStatus::InProgress | EntryStatus::Exceeded => {}
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.requeued.len() + self.done.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Queue store abstraction.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert producer entries as `Open` rows with no attempts.
    async fn enqueue(&self, entries: Vec<NewEntry>) -> Result<Vec<EntryId>, StoreError>;

    /// Select due entries FIFO (`created_at`, then id) under row locks and
    /// stamp them `InProgress`, atomically.
    ///
    /// Returns `StoreError::LockTimeout` when the locks are not granted
    /// within `query.lock_wait`; nothing is stamped in that case.
    async fn select_due(
        &self,
        tenant_id: TenantId,
        query: &SelectQuery,
    ) -> Result<Selection, StoreError>;

    /// Set entries to `Exceeded`.
    async fn mark_exceeded(&self, tenant_id: TenantId, ids: &[EntryId]) -> Result<(), StoreError>;

    /// Compare stored `last_attempt_at` values with the remembered ones and,
    /// if none changed, stamp all rows with a fresh timestamp.
    async fn keepalive(
        &self,
        tenant_id: TenantId,
        expected: &[(EntryId, DateTime<Utc>)],
        lock_wait: Duration,
    ) -> Result<LeaseCheck, StoreError>;

    /// Write final statuses in one transaction.
    async fn persist_statuses(
        &self,
        tenant_id: TenantId,
        batch: &StatusBatch,
    ) -> Result<(), StoreError>;

    /// Load a single entry.
    async fn get(&self, tenant_id: TenantId, id: EntryId) -> Result<Option<QueueEntry>, StoreError>;
}
