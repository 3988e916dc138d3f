//! Payload checks and grouping of selected entries into processing units.

use std::collections::HashMap;

use tracing::{error, warn};

use rowqueue_core::{ClusterKey, EntryStatus, EventKey, ProcessingUnit, QueueEntry, TenantId};

use super::aggregator::StatusAggregator;
use super::handler::{EventHandler, guarded, guarded_sync};
use super::transaction::TransactionProvider;
use crate::error::HandlerError;

/// Check every entry's payload and group the survivors by cluster key.
///
/// Runs inside a business transaction that is always rolled back. Entries
/// whose check yields no payload are recorded done; entries whose check
/// fails are recorded failed. If grouping itself fails, every entry of the
/// chunk is recorded failed and no unit is returned.
pub(crate) async fn cluster<P: TransactionProvider>(
    transactions: &P,
    handler: &dyn EventHandler<P::Tx>,
    tenant_id: TenantId,
    key: &EventKey,
    entries: &[QueueEntry],
    aggregator: &mut StatusAggregator,
) -> Vec<ProcessingUnit> {
    let mut tx = match transactions.begin(tenant_id).await {
        Ok(tx) => tx,
        Err(err) => {
            error!(tenant_id = %tenant_id, event = %key, error = %err, "clustering failed");
            aggregator.record_all_error(entries);
            return Vec::new();
        }
    };

    let grouped = group(&mut tx, handler, key, entries, aggregator).await;

    if let Err(err) = transactions.rollback(tx).await {
        warn!(tenant_id = %tenant_id, event = %key, error = %err, "check transaction rollback failed");
    }

    match grouped {
        Ok(units) => units,
        Err(err) => {
            error!(
                tenant_id = %tenant_id,
                event = %key,
                entries = entries.len(),
                error = %err,
                "clustering failed, marking the chunk failed"
            );
            aggregator.record_all_error(entries);
            Vec::new()
        }
    }
}

async fn group<Tx: Send>(
    tx: &mut Tx,
    handler: &dyn EventHandler<Tx>,
    key: &EventKey,
    entries: &[QueueEntry],
    aggregator: &mut StatusAggregator,
) -> Result<Vec<ProcessingUnit>, HandlerError> {
    let mut units: Vec<ProcessingUnit> = Vec::new();
    let mut index: HashMap<ClusterKey, usize> = HashMap::new();

    for entry in entries {
        let payload = match guarded(handler.check_payload(tx, entry)).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                aggregator.record(entry.id, EntryStatus::Done);
                continue;
            }
            Err(err) => {
                warn!(event = %key, entry_id = %entry.id, error = %err, "payload check failed");
                aggregator.record(entry.id, EntryStatus::Error);
                continue;
            }
        };

        let cluster_key = guarded_sync(|| handler.cluster_key(entry, &payload))?;
        match index.get(&cluster_key) {
            Some(&i) => units[i].entries.push(entry.clone()),
            None => {
                index.insert(cluster_key.clone(), units.len());
                units.push(ProcessingUnit {
                    key: cluster_key,
                    entries: vec![entry.clone()],
                    payload,
                });
            }
        }
    }

    guarded(handler.before_processing(tx, &mut units)).await?;
    Ok(units)
}
