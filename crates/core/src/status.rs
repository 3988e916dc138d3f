//! Entry statuses and the worst-status-wins verdict map.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::EntryId;

/// Lifecycle status of a queue entry.
///
/// The integer codes are what the queue table stores; they must not change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Open,
    InProgress,
    Done,
    Error,
    Exceeded,
}

impl EntryStatus {
    pub const fn code(self) -> i16 {
        match self {
            Self::Open => 0,
            Self::InProgress => 1,
            Self::Done => 2,
            Self::Error => 3,
            Self::Exceeded => 4,
        }
    }

    pub fn from_code(code: i16) -> DomainResult<Self> {
        match code {
            0 => Ok(Self::Open),
            1 => Ok(Self::InProgress),
            2 => Ok(Self::Done),
            3 => Ok(Self::Error),
            4 => Ok(Self::Exceeded),
            other => Err(DomainError::UnknownStatus(other)),
        }
    }

    /// Whether a handler may report this status as a verdict.
    pub const fn is_reportable(self) -> bool {
        matches!(self, Self::Open | Self::Done | Self::Error)
    }

    /// Terminal entries are never selected again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Exceeded)
    }
}

impl core::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Error => "error",
            Self::Exceeded => "exceeded",
        };
        f.write_str(s)
    }
}

/// Per-tick verdicts keyed by entry.
///
/// Merging follows worst-status-wins: once an entry is `Error` it stays
/// `Error`; any other recorded status is replaced by the latest one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusMap {
    inner: HashMap<EntryId, EntryStatus>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verdict and return the status now held for the entry.
    pub fn record(&mut self, id: EntryId, status: EntryStatus) -> EntryStatus {
        let slot = self.inner.entry(id).or_insert(status);
        if *slot != EntryStatus::Error {
            *slot = status;
        }
        *slot
    }

    /// Merge another map into this one, entry by entry.
    pub fn merge(&mut self, other: StatusMap) {
        for (id, status) in other.inner {
            self.record(id, status);
        }
    }

    pub fn get(&self, id: &EntryId) -> Option<EntryStatus> {
        self.inner.get(id).copied()
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn contains_error(&self) -> bool {
        self.inner.values().any(|s| *s == EntryStatus::Error)
    }

    pub fn remove(&mut self, id: &EntryId) -> Option<EntryStatus> {
        self.inner.remove(id)
    }

    pub fn retain(&mut self, mut f: impl FnMut(&EntryId, &EntryStatus) -> bool) {
        self.inner.retain(|id, status| f(id, status));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntryId, &EntryStatus)> {
        self.inner.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntryId> {
        self.inner.keys()
    }
}

impl Extend<(EntryId, EntryStatus)> for StatusMap {
    fn extend<I: IntoIterator<Item = (EntryId, EntryStatus)>>(&mut self, iter: I) {
        for (id, status) in iter {
            self.record(id, status);
        }
    }
}

impl FromIterator<(EntryId, EntryStatus)> for StatusMap {
    fn from_iter<I: IntoIterator<Item = (EntryId, EntryStatus)>>(iter: I) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

impl IntoIterator for StatusMap {
    type Item = (EntryId, EntryStatus);
    type IntoIter = std::collections::hash_map::IntoIter<EntryId, EntryStatus>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}
