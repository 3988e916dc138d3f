//! Queue entries and the per-tick values built from them.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{EntryId, TenantId};
use crate::status::EntryStatus;

/// Routing key of an entry: `(type, sub_type)` selects the handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub event_type: String,
    pub sub_type: String,
}

impl EventKey {
    pub fn new(event_type: impl Into<String>, sub_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            sub_type: sub_type.into(),
        }
    }
}

impl core::fmt::Display for EventKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}##{}", self.event_type, self.sub_type)
    }
}

/// Current time at the precision the queue table stores (microseconds).
///
/// Lease checks compare stored and remembered timestamps for equality, so
/// every timestamp written by the engine goes through this.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// One persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub sub_type: String,
    /// Opaque payload, decoded by the handler.
    pub payload: Option<String>,
    pub status: EntryStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.event_type.clone(), self.sub_type.clone())
    }

    pub fn has_key(&self, key: &EventKey) -> bool {
        self.event_type == key.event_type && self.sub_type == key.sub_type
    }

    /// Selection predicate, independent of routing key.
    ///
    /// - `Open` is always due.
    /// - `Error` is due once its last attempt is not after `tick_start`.
    /// - `InProgress` is due once its last attempt is not after
    ///   `orphan_cutoff` (the holder is presumed dead).
    pub fn is_due(&self, tick_start: DateTime<Utc>, orphan_cutoff: DateTime<Utc>) -> bool {
        match self.status {
            EntryStatus::Open => true,
            EntryStatus::Error => self.last_attempt_at.is_none_or(|ts| ts <= tick_start),
            EntryStatus::InProgress => self.last_attempt_at.is_none_or(|ts| ts <= orphan_cutoff),
            EntryStatus::Done | EntryStatus::Exceeded => false,
        }
    }
}

/// An entry as submitted by a producer, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub tenant_id: TenantId,
    pub event_type: String,
    pub sub_type: String,
    pub payload: Option<String>,
}

impl NewEntry {
    pub fn new(tenant_id: TenantId, key: &EventKey, payload: Option<String>) -> Self {
        Self {
            tenant_id,
            event_type: key.event_type.clone(),
            sub_type: key.sub_type.clone(),
            payload,
        }
    }

    /// Convenience constructor serializing a JSON payload.
    pub fn with_json(tenant_id: TenantId, key: &EventKey, payload: &JsonValue) -> Self {
        Self::new(tenant_id, key, Some(payload.to_string()))
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(self.event_type.clone(), self.sub_type.clone())
    }

    /// Materialize as an `Open` entry with no attempts.
    pub fn into_entry(self, created_at: DateTime<Utc>) -> DomainResult<QueueEntry> {
        if self.event_type.is_empty() || self.sub_type.is_empty() {
            return Err(DomainError::validation("type and sub_type must not be empty"));
        }
        Ok(QueueEntry {
            id: EntryId::new(),
            tenant_id: self.tenant_id,
            event_type: self.event_type,
            sub_type: self.sub_type,
            payload: self.payload,
            status: EntryStatus::Open,
            attempts: 0,
            created_at,
            last_attempt_at: None,
        })
    }
}

/// Caller-defined grouping key of entries processed together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterKey(String);

impl ClusterKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<EntryId> for ClusterKey {
    fn from(value: EntryId) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClusterKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ClusterKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl core::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entries sharing a cluster key, dispatched together within one tick.
///
/// `payload` is the one produced for the first entry of the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingUnit {
    pub key: ClusterKey,
    pub entries: Vec<QueueEntry>,
    pub payload: JsonValue,
}

impl ProcessingUnit {
    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Verdicts assigning the same status to every entry of the unit.
    pub fn verdicts(&self, status: EntryStatus) -> Vec<Verdict> {
        self.entries.iter().map(|e| Verdict::new(e.id, status)).collect()
    }
}

/// A handler's outcome for one entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub id: EntryId,
    pub status: EntryStatus,
}

impl Verdict {
    pub fn new(id: EntryId, status: EntryStatus) -> Self {
        Self { id, status }
    }

    pub fn done(id: EntryId) -> Self {
        Self::new(id, EntryStatus::Done)
    }

    pub fn error(id: EntryId) -> Self {
        Self::new(id, EntryStatus::Error)
    }

    /// Hand the entry back to the queue without consuming a retry.
    pub fn requeue(id: EntryId) -> Self {
        Self::new(id, EntryStatus::Open)
    }
}
