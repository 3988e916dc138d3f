//! Entry selection and exceeded handling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use rowqueue_core::{EntryId, EventKey, QueueEntry, TenantId};

use super::handler::{EventHandler, guarded};
use super::transaction::TransactionProvider;
use crate::config::{EngineConfig, EventConfig};
use crate::error::StoreError;
use crate::store::{QueueStore, SelectQuery, Selection};

/// Selection parameters of one chunk.
pub(crate) fn select_query(
    config: &EngineConfig,
    event: &EventConfig,
    tick_start: DateTime<Utc>,
) -> SelectQuery {
    let orphan_timeout =
        chrono::Duration::from_std(config.orphan_timeout()).unwrap_or(chrono::Duration::MAX);
    SelectQuery {
        key: event.key(),
        limit: event.chunk_size,
        retry_limit: event.retry_limit,
        tick_start,
        orphan_cutoff: tick_start
            .checked_sub_signed(orphan_timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        lock_wait: config.row_lock_wait(),
    }
}

/// Select due entries.
///
/// Row-lock contention yields an empty selection: the entries are picked up
/// next tick. Other store errors propagate.
pub(crate) async fn select(
    store: &dyn QueueStore,
    tenant_id: TenantId,
    query: &SelectQuery,
) -> Result<Selection, StoreError> {
    match store.select_due(tenant_id, query).await {
        Ok(selection) => Ok(selection),
        Err(StoreError::LockTimeout(wait)) => {
            debug!(
                tenant_id = %tenant_id,
                event = %query.key,
                wait = ?wait,
                "rows locked by another worker, nothing selected"
            );
            Ok(Selection::default())
        }
        Err(err) => Err(err),
    }
}

/// Mark entries with exhausted retries and run the handler's hook once for
/// the whole batch.
pub(crate) async fn handle_exceeded<P: TransactionProvider>(
    store: &Arc<dyn QueueStore>,
    transactions: &P,
    handler: &dyn EventHandler<P::Tx>,
    tenant_id: TenantId,
    key: &EventKey,
    exceeded: &[QueueEntry],
) {
    if exceeded.is_empty() {
        return;
    }
    let ids: Vec<EntryId> = exceeded.iter().map(|e| e.id).collect();
    error!(
        tenant_id = %tenant_id,
        event = %key,
        entries = ?ids,
        "retry limit reached, entries will not be dispatched again"
    );

    if let Err(err) = store.mark_exceeded(tenant_id, &ids).await {
        error!(tenant_id = %tenant_id, event = %key, error = %err, "failed to mark entries exceeded");
        return;
    }

    let mut tx = match transactions.begin(tenant_id).await {
        Ok(tx) => tx,
        Err(err) => {
            error!(tenant_id = %tenant_id, event = %key, error = %err, "could not open transaction for exceeded hook");
            return;
        }
    };
    match guarded(handler.on_exceeded(&mut tx, exceeded)).await {
        Ok(()) => {
            if let Err(err) = transactions.commit(tx).await {
                error!(tenant_id = %tenant_id, event = %key, error = %err, "exceeded hook commit failed");
            }
        }
        Err(err) => {
            error!(tenant_id = %tenant_id, event = %key, error = %err, "exceeded hook failed");
            if let Err(err) = transactions.rollback(tx).await {
                warn!(tenant_id = %tenant_id, event = %key, error = %err, "exceeded hook rollback failed");
            }
        }
    }
}
