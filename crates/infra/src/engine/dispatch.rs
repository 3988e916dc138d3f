//! Dispatch of processing units to their handler under bounded concurrency.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{error, warn};

use rowqueue_core::{ClusterKey, EntryId, EntryStatus, EventKey, ProcessingUnit, TenantId, Verdict};

use super::aggregator::StatusAggregator;
use super::handler::{EventHandler, UnitContext, guarded};
use super::keepalive::Keepalive;
use super::transaction::TransactionProvider;
use crate::config::{EventConfig, MAX_PARALLELISM};

/// What became of one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed {
        cluster_key: ClusterKey,
        verdicts: Vec<Verdict>,
    },
    /// Entries were touched by someone else; nothing is written for them.
    Stale {
        cluster_key: ClusterKey,
        entries: Vec<EntryId>,
    },
}

impl UnitOutcome {
    fn failed(unit: &ProcessingUnit) -> Self {
        Self::Completed {
            cluster_key: unit.key.clone(),
            verdicts: unit.verdicts(EntryStatus::Error),
        }
    }

    fn stale(unit: &ProcessingUnit) -> Self {
        Self::Stale {
            cluster_key: unit.key.clone(),
            entries: unit.entry_ids(),
        }
    }

    fn has_error(&self) -> bool {
        match self {
            Self::Completed { verdicts, .. } => verdicts.iter().any(|v| v.status == EntryStatus::Error),
            Self::Stale { .. } => false,
        }
    }

    /// Turn every verdict into an error, e.g. after a failed commit.
    fn into_failed(self, unit: &ProcessingUnit) -> Self {
        match self {
            Self::Completed { cluster_key, verdicts } => {
                let mut failed: Vec<Verdict> = verdicts
                    .into_iter()
                    .map(|v| Verdict::error(v.id))
                    .collect();
                failed.extend(unit.verdicts(EntryStatus::Error));
                Self::Completed {
                    cluster_key,
                    verdicts: failed,
                }
            }
            stale => stale,
        }
    }
}

/// Everything dispatch needs for one chunk of one `(tenant, event)`.
pub(crate) struct UnitScope<'a, P: TransactionProvider> {
    pub tenant_id: TenantId,
    pub event: &'a EventConfig,
    pub key: &'a EventKey,
    pub transactions: &'a P,
    pub handler: &'a dyn EventHandler<P::Tx>,
    pub keepalive: &'a Keepalive,
}

impl<P: TransactionProvider> UnitScope<'_, P> {
    /// Run every unit and hand each outcome to the aggregator.
    pub async fn dispatch(&self, units: Vec<ProcessingUnit>, aggregator: &mut StatusAggregator) {
        if units.is_empty() {
            return;
        }
        if self.event.shares_transaction() {
            self.dispatch_shared(units, aggregator).await;
        } else {
            self.dispatch_isolated(units, aggregator).await;
        }
    }

    /// Serial mode: one business transaction for all units of the chunk,
    /// rolled back as a whole if any entry failed.
    async fn dispatch_shared(&self, units: Vec<ProcessingUnit>, aggregator: &mut StatusAggregator) {
        let mut tx = match self.transactions.begin(self.tenant_id).await {
            Ok(tx) => tx,
            Err(err) => {
                error!(
                    tenant_id = %self.tenant_id,
                    event = %self.key,
                    error = %err,
                    "could not open transaction, failing all units"
                );
                for unit in &units {
                    aggregator.unit_finished(UnitOutcome::failed(unit)).await;
                }
                return;
            }
        };

        let mut outcomes = Vec::with_capacity(units.len());
        for unit in &units {
            let outcome = if self.keepalive.check(&unit.entry_ids()).await.is_stale() {
                UnitOutcome::stale(unit)
            } else {
                self.invoke(&mut tx, unit).await
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().any(UnitOutcome::has_error);
        let finished = if failed {
            self.transactions.rollback(tx).await
        } else {
            self.transactions.commit(tx).await
        };
        if let Err(err) = finished {
            error!(
                tenant_id = %self.tenant_id,
                event = %self.key,
                error = %err,
                "failed to finish shared transaction"
            );
            if !failed {
                outcomes = outcomes
                    .into_iter()
                    .zip(&units)
                    .map(|(outcome, unit)| outcome.into_failed(unit))
                    .collect();
            }
        }

        for outcome in outcomes {
            aggregator.unit_finished(outcome).await;
        }
    }

    /// Parallel or per-unit mode: each unit in its own transaction, at most
    /// `parallelism` in flight.
    async fn dispatch_isolated(&self, units: Vec<ProcessingUnit>, aggregator: &mut StatusAggregator) {
        let limit = self.event.parallelism.clamp(1, MAX_PARALLELISM);
        let mut waiting = units.iter();
        let mut running = FuturesUnordered::new();
        for unit in waiting.by_ref().take(limit) {
            running.push(self.run_isolated(unit));
        }
        while let Some(outcome) = running.next().await {
            if let Some(unit) = waiting.next() {
                running.push(self.run_isolated(unit));
            }
            aggregator.unit_finished(outcome).await;
        }
    }

    async fn run_isolated(&self, unit: &ProcessingUnit) -> UnitOutcome {
        if self.keepalive.check(&unit.entry_ids()).await.is_stale() {
            return UnitOutcome::stale(unit);
        }

        let mut tx = match self.transactions.begin(self.tenant_id).await {
            Ok(tx) => tx,
            Err(err) => {
                error!(
                    tenant_id = %self.tenant_id,
                    event = %self.key,
                    cluster_key = %unit.key,
                    error = %err,
                    "could not open unit transaction"
                );
                return UnitOutcome::failed(unit);
            }
        };

        let outcome = self.invoke(&mut tx, unit).await;
        if matches!(outcome, UnitOutcome::Stale { .. }) || outcome.has_error() {
            if let Err(err) = self.transactions.rollback(tx).await {
                warn!(cluster_key = %unit.key, error = %err, "unit rollback failed");
            }
            return outcome;
        }
        match self.transactions.commit(tx).await {
            Ok(()) => outcome,
            Err(err) => {
                error!(
                    tenant_id = %self.tenant_id,
                    event = %self.key,
                    cluster_key = %unit.key,
                    error = %err,
                    "unit commit failed"
                );
                outcome.into_failed(unit)
            }
        }
    }

    async fn invoke(&self, tx: &mut P::Tx, unit: &ProcessingUnit) -> UnitOutcome {
        let mut ctx = UnitContext::new(self.tenant_id, self.key, &unit.key, tx, self.keepalive);
        let result = guarded(self.handler.process(&mut ctx, unit)).await;

        // The handler's own keepalive may have found the unit stale.
        if self.keepalive.selected().any_abandoned(&unit.entry_ids()) {
            return UnitOutcome::stale(unit);
        }

        match result {
            Ok(verdicts) => UnitOutcome::Completed {
                cluster_key: unit.key.clone(),
                verdicts,
            },
            Err(err) => {
                error!(
                    tenant_id = %self.tenant_id,
                    event = %self.key,
                    cluster_key = %unit.key,
                    entries = unit.entries.len(),
                    error = %err,
                    "handler failed, marking unit failed"
                );
                UnitOutcome::failed(unit)
            }
        }
    }
}
