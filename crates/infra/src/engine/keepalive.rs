//! Lease extension and stale detection for in-flight entries.
//!
//! Every selected entry is remembered with the `last_attempt_at` it had when
//! the engine last wrote it. A check compares those values with the stored
//! ones in a short side transaction: unchanged rows get a fresh timestamp
//! (pushing back the orphan timeout), a changed row means another worker
//! took the entry over and the unit must be abandoned.
//!
//! Checks are single-flight per entry: a caller asking about an entry that
//! already has a check in flight awaits that check instead of issuing
//! another one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use tracing::{debug, warn};

use rowqueue_core::{EntryId, QueueEntry, TenantId};

use crate::store::{LeaseCheck, QueueStore};

/// Result of a keepalive check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// Rows were untouched; the lease now runs from a fresh timestamp.
    Extended,
    /// At least one entry was modified by someone else, or already
    /// abandoned earlier in the tick.
    Stale,
    /// Not checked: staleness checking is off, or the store could not be
    /// asked. Processing continues without an extended lease.
    Unverified,
}

impl KeepaliveOutcome {
    pub fn is_stale(self) -> bool {
        matches!(self, Self::Stale)
    }

    fn combine(outcomes: impl IntoIterator<Item = Self>) -> Self {
        let mut combined = Self::Extended;
        for outcome in outcomes {
            match outcome {
                Self::Stale => return Self::Stale,
                Self::Unverified => combined = Self::Unverified,
                Self::Extended => {}
            }
        }
        combined
    }
}

#[derive(Debug, Default)]
struct Tracked {
    entries: HashMap<EntryId, QueueEntry>,
    abandoned: HashSet<EntryId>,
}

/// Entries selected for dispatch in one tick, shared by the keepalive, the
/// dispatcher and the status aggregator.
///
/// Abandoned entries leave the set for good; nothing is persisted for them
/// this tick.
#[derive(Debug, Clone, Default)]
pub struct SelectedEntries {
    inner: Arc<Mutex<Tracked>>,
}

impl SelectedEntries {
    pub fn new(entries: &[QueueEntry]) -> Self {
        let tracked = Tracked {
            entries: entries.iter().map(|e| (e.id, e.clone())).collect(),
            abandoned: HashSet::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(tracked)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn is_abandoned(&self, id: &EntryId) -> bool {
        self.lock().abandoned.contains(id)
    }

    pub fn any_abandoned(&self, ids: &[EntryId]) -> bool {
        let tracked = self.lock();
        ids.iter().any(|id| tracked.abandoned.contains(id))
    }

    /// Stop tracking entries; they get no status write this tick.
    pub fn abandon(&self, ids: &[EntryId]) {
        let mut tracked = self.lock();
        for id in ids {
            if tracked.entries.remove(id).is_some() {
                tracked.abandoned.insert(*id);
            }
        }
    }

    pub fn ids(&self) -> Vec<EntryId> {
        self.lock().entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remembered timestamps, or `None` if any id is no longer tracked.
    fn remembered(&self, ids: &[EntryId]) -> Option<Vec<(EntryId, DateTime<Utc>)>> {
        let tracked = self.lock();
        ids.iter()
            .map(|id| {
                let entry = tracked.entries.get(id)?;
                entry.last_attempt_at.map(|at| (*id, at))
            })
            .collect()
    }

    fn set_last_attempt(&self, ids: &[EntryId], at: DateTime<Utc>) {
        let mut tracked = self.lock();
        for id in ids {
            if let Some(entry) = tracked.entries.get_mut(id) {
                entry.last_attempt_at = Some(at);
            }
        }
    }
}

type SharedCheck = Shared<BoxFuture<'static, KeepaliveOutcome>>;

#[derive(Clone)]
struct InFlight {
    seq: u64,
    check: SharedCheck,
}

type InFlightMap = Arc<Mutex<HashMap<EntryId, InFlight>>>;

/// Keepalive for one tick of one `(tenant, event)`.
pub struct Keepalive {
    store: Arc<dyn QueueStore>,
    tenant_id: TenantId,
    lock_wait: Duration,
    enabled: bool,
    selected: SelectedEntries,
    inflight: InFlightMap,
    next_seq: AtomicU64,
}

impl core::fmt::Debug for Keepalive {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Keepalive")
            .field("tenant_id", &self.tenant_id)
            .field("enabled", &self.enabled)
            .field("selected", &self.selected.len())
            .finish_non_exhaustive()
    }
}

impl Keepalive {
    pub fn new(
        store: Arc<dyn QueueStore>,
        tenant_id: TenantId,
        lock_wait: Duration,
        enabled: bool,
        selected: SelectedEntries,
    ) -> Self {
        Self {
            store,
            tenant_id,
            lock_wait,
            enabled,
            selected,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn selected(&self) -> &SelectedEntries {
        &self.selected
    }

    /// Check entries and extend their lease.
    ///
    /// Ids with a check already in flight join it; the rest are checked
    /// together in one new round trip that later callers can join in turn.
    pub async fn check(&self, ids: &[EntryId]) -> KeepaliveOutcome {
        if !self.enabled {
            return KeepaliveOutcome::Unverified;
        }
        if ids.is_empty() {
            return KeepaliveOutcome::Extended;
        }

        let checks = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            let mut joined = HashSet::new();
            let mut checks = Vec::new();
            let mut fresh = Vec::new();
            for id in ids {
                match inflight.get(id) {
                    Some(running) => {
                        if joined.insert(running.seq) {
                            checks.push(running.check.clone());
                        }
                    }
                    None => fresh.push(*id),
                }
            }
            if !fresh.is_empty() {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let check = run_check(
                    Arc::clone(&self.store),
                    self.tenant_id,
                    self.lock_wait,
                    self.selected.clone(),
                    Arc::clone(&self.inflight),
                    seq,
                    fresh.clone(),
                )
                .boxed()
                .shared();
                for id in fresh {
                    inflight.insert(
                        id,
                        InFlight {
                            seq,
                            check: check.clone(),
                        },
                    );
                }
                checks.push(check);
            }
            checks
        };

        KeepaliveOutcome::combine(join_all(checks).await)
    }
}

async fn run_check(
    store: Arc<dyn QueueStore>,
    tenant_id: TenantId,
    lock_wait: Duration,
    selected: SelectedEntries,
    inflight: InFlightMap,
    seq: u64,
    ids: Vec<EntryId>,
) -> KeepaliveOutcome {
    let outcome = match selected.remembered(&ids) {
        None => KeepaliveOutcome::Stale,
        Some(expected) => match store.keepalive(tenant_id, &expected, lock_wait).await {
            Ok(LeaseCheck::Extended(at)) => {
                selected.set_last_attempt(&ids, at);
                debug!(tenant_id = %tenant_id, entries = ids.len(), "lease extended");
                KeepaliveOutcome::Extended
            }
            Ok(LeaseCheck::Modified) => {
                warn!(
                    tenant_id = %tenant_id,
                    entries = ?ids,
                    "entries modified by another worker, abandoning them for this tick"
                );
                selected.abandon(&ids);
                KeepaliveOutcome::Stale
            }
            Err(err) => {
                warn!(tenant_id = %tenant_id, error = %err, "keepalive check failed, lease not extended");
                KeepaliveOutcome::Unverified
            }
        },
    };

    inflight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|_, running| running.seq != seq);
    outcome
}
