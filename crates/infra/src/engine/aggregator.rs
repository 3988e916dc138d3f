//! Status aggregation: per-entry verdicts merged worst-wins, validated and
//! persisted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use rowqueue_core::{EntryId, EntryStatus, EventKey, QueueEntry, StatusMap, TenantId, Verdict};

use super::dispatch::UnitOutcome;
use super::keepalive::SelectedEntries;
use crate::store::{QueueStore, StatusBatch};

/// Persisted verdict counts of one aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub done: usize,
    pub failed: usize,
    pub requeued: usize,
    /// Entries abandoned because another worker touched them.
    pub stale: usize,
}

impl StatusCounts {
    fn add_batch(&mut self, batch: &StatusBatch) {
        self.done += batch.done.len();
        self.failed += batch.failed.len();
        self.requeued += batch.requeued.len();
    }
}

/// Collects the verdicts of one chunk of one `(tenant, event)`.
///
/// In per-unit mode each unit's verdicts are written as soon as the unit
/// finishes; everything else is written once by [`finish`](Self::finish).
pub struct StatusAggregator {
    store: Arc<dyn QueueStore>,
    tenant_id: TenantId,
    key: EventKey,
    selected: SelectedEntries,
    per_unit: bool,
    pending: StatusMap,
    /// Statuses already written in per-unit mode.
    committed: HashMap<EntryId, EntryStatus>,
    counts: StatusCounts,
}

impl StatusAggregator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        tenant_id: TenantId,
        key: EventKey,
        selected: SelectedEntries,
        per_unit: bool,
    ) -> Self {
        Self {
            store,
            tenant_id,
            key,
            selected,
            per_unit,
            pending: StatusMap::new(),
            committed: HashMap::new(),
            counts: StatusCounts::default(),
        }
    }

    /// Record an engine-decided status (payload checks, clustering failures).
    pub fn record(&mut self, id: EntryId, status: EntryStatus) {
        self.pending.record(id, status);
    }

    /// Mark every given entry failed.
    pub fn record_all_error(&mut self, entries: &[QueueEntry]) {
        for entry in entries {
            self.pending.record(entry.id, EntryStatus::Error);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_status(&self, id: &EntryId) -> Option<EntryStatus> {
        self.pending.get(id)
    }

    /// Take in the outcome of one dispatched unit.
    pub async fn unit_finished(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Stale { cluster_key, entries } => {
                debug!(
                    tenant_id = %self.tenant_id,
                    event = %self.key,
                    cluster_key = %cluster_key,
                    entries = entries.len(),
                    "unit abandoned, no status written"
                );
                self.selected.abandon(&entries);
                self.counts.stale += entries.len();
            }
            UnitOutcome::Completed { cluster_key, verdicts } => {
                let mut unit = StatusMap::new();
                for verdict in verdicts {
                    if self.accepts(&verdict) {
                        unit.record(verdict.id, verdict.status);
                    }
                }
                if self.per_unit {
                    self.persist_unit(unit, &cluster_key.to_string()).await;
                } else {
                    self.pending.merge(unit);
                }
            }
        }
    }

    fn accepts(&self, verdict: &Verdict) -> bool {
        if !verdict.status.is_reportable() {
            warn!(
                tenant_id = %self.tenant_id,
                event = %self.key,
                entry_id = %verdict.id,
                status = %verdict.status,
                "handler reported a disallowed status, dropping it"
            );
            return false;
        }
        if !self.selected.contains(&verdict.id) {
            if self.selected.is_abandoned(&verdict.id) {
                debug!(entry_id = %verdict.id, "verdict for abandoned entry dropped");
            } else {
                error!(
                    tenant_id = %self.tenant_id,
                    event = %self.key,
                    entry_id = %verdict.id,
                    "handler reported a verdict for an entry not selected this tick, dropping it"
                );
            }
            return false;
        }
        match self.committed.get(&verdict.id) {
            None => true,
            // Error is absorbing: it overrides an earlier Done or Open write.
            Some(&written) if verdict.status == EntryStatus::Error && written != EntryStatus::Error => true,
            Some(_) => {
                debug!(
                    tenant_id = %self.tenant_id,
                    event = %self.key,
                    entry_id = %verdict.id,
                    status = %verdict.status,
                    "status already written for entry, dropping verdict"
                );
                false
            }
        }
    }

    async fn persist_unit(&mut self, unit: StatusMap, cluster_key: &str) {
        let batch = StatusBatch::from_map(&unit);
        if batch.is_empty() {
            return;
        }
        // Written or not, these entries are settled for this tick. A failed
        // write leaves them in progress until the orphan timeout reclaims them.
        self.committed.extend(unit.iter().map(|(id, status)| (*id, *status)));
        match self.store.persist_statuses(self.tenant_id, &batch).await {
            Ok(()) => self.counts.add_batch(&batch),
            Err(err) => error!(
                tenant_id = %self.tenant_id,
                event = %self.key,
                cluster_key,
                error = %err,
                "failed to persist unit statuses"
            ),
        }
    }

    /// Default missing verdicts to `Error` and write what is pending.
    pub async fn finish(mut self) -> StatusCounts {
        for id in self.selected.ids() {
            if self.pending.contains(&id) || self.committed.contains_key(&id) {
                continue;
            }
            error!(
                tenant_id = %self.tenant_id,
                event = %self.key,
                entry_id = %id,
                "no verdict reported for selected entry, marking it failed"
            );
            self.pending.record(id, EntryStatus::Error);
        }

        let selected = &self.selected;
        let committed = &self.committed;
        self.pending
            .retain(|id, _| selected.contains(id) && !committed.contains_key(id));

        let batch = StatusBatch::from_map(&self.pending);
        if batch.is_empty() {
            return self.counts;
        }
        match self.store.persist_statuses(self.tenant_id, &batch).await {
            Ok(()) => self.counts.add_batch(&batch),
            Err(err) => error!(
                tenant_id = %self.tenant_id,
                event = %self.key,
                entries = batch.len(),
                error = %err,
                "failed to persist statuses, entries stay in progress until reclaimed"
            ),
        }
        self.counts
    }
}
