//! The engine: one tick of every configured event for one tenant.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use rowqueue_core::{EntryId, EventKey, NewEntry, TenantId, now_micros};

use super::aggregator::StatusAggregator;
use super::clustering;
use super::dispatch::UnitScope;
use super::handler::{EventHandler, HandlerRegistry};
use super::keepalive::{Keepalive, SelectedEntries};
use super::selector;
use super::transaction::TransactionProvider;
use crate::config::{EngineConfig, EventConfig};
use crate::error::{RegistryError, StoreError};
use crate::lock::{DistributedLock, LockKey};
use crate::store::QueueStore;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Rows matched by selection, exceeded ones included.
    pub selected: usize,
    pub exceeded: usize,
    pub done: usize,
    pub failed: usize,
    pub requeued: usize,
    pub stale: usize,
}

impl AddAssign for TickSummary {
    fn add_assign(&mut self, other: Self) {
        self.selected += other.selected;
        self.exceeded += other.exceeded;
        self.done += other.done;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.stale += other.stale;
    }
}

/// Processing engine, generic over the business transactions handed to
/// handlers.
pub struct Engine<P: TransactionProvider> {
    config: Arc<EngineConfig>,
    store: Arc<dyn QueueStore>,
    lock: Arc<dyn DistributedLock>,
    transactions: P,
    handlers: HandlerRegistry<P::Tx>,
}

impl<P: TransactionProvider> Engine<P> {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn QueueStore>,
        lock: Arc<dyn DistributedLock>,
        transactions: P,
    ) -> Self {
        Self {
            config,
            store,
            lock,
            transactions,
            handlers: HandlerRegistry::new(),
        }
    }

    /// Register the handler of a configured event.
    pub fn register<H>(&mut self, key: EventKey, handler: H) -> Result<(), RegistryError>
    where
        H: EventHandler<P::Tx> + 'static,
    {
        if self.config.event(&key).is_none() {
            return Err(RegistryError::UnknownEvent(key));
        }
        self.handlers.register(key, handler)
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn lock(&self) -> &Arc<dyn DistributedLock> {
        &self.lock
    }

    /// Insert producer entries. Every entry must target a configured event.
    pub async fn enqueue(&self, entries: Vec<NewEntry>) -> Result<Vec<EntryId>, StoreError> {
        if let Some(unknown) = entries
            .iter()
            .map(NewEntry::key)
            .find(|key| self.config.event(key).is_none())
        {
            return Err(StoreError::UnknownEvent(unknown));
        }
        self.store.enqueue(entries).await
    }

    /// Process every configured event of one tenant.
    ///
    /// Only store failures other than row-lock contention abort the tenant;
    /// everything else is logged and contained per entry, unit or event.
    #[instrument(skip(self))]
    pub async fn run_tenant(&self, tenant_id: TenantId) -> Result<TickSummary, StoreError> {
        let mut summary = TickSummary::default();
        for event in &self.config.events {
            summary += self.process_event(tenant_id, event).await?;
        }
        Ok(summary)
    }

    async fn process_event(
        &self,
        tenant_id: TenantId,
        event: &EventConfig,
    ) -> Result<TickSummary, StoreError> {
        let key = event.key();
        let Some(handler) = self.handlers.get(&key) else {
            error!(tenant_id = %tenant_id, event = %key, "no handler registered, skipping event");
            return Ok(TickSummary::default());
        };

        if event.concurrent_processing {
            return self.process_chunks(tenant_id, event, &key, handler.as_ref()).await;
        }

        let lock_key = LockKey::tenant(tenant_id, key.to_string());
        match self.lock.acquire(&lock_key, self.config.orphan_timeout()).await {
            Ok(true) => {}
            Ok(false) => {
                info!(tenant_id = %tenant_id, event = %key, "event is processed by another instance, skipping");
                return Ok(TickSummary::default());
            }
            Err(err) => {
                warn!(tenant_id = %tenant_id, event = %key, error = %err, "could not take event lock, skipping");
                return Ok(TickSummary::default());
            }
        }

        let result = self.process_chunks(tenant_id, event, &key, handler.as_ref()).await;
        if let Err(err) = self.lock.release(&lock_key).await {
            warn!(tenant_id = %tenant_id, event = %key, error = %err, "failed to release event lock");
        }
        result
    }

    async fn process_chunks(
        &self,
        tenant_id: TenantId,
        event: &EventConfig,
        key: &EventKey,
        handler: &dyn EventHandler<P::Tx>,
    ) -> Result<TickSummary, StoreError> {
        let tick_start = now_micros();
        let started = Instant::now();
        let budget = self.config.run_interval();
        let mut summary = TickSummary::default();
        let mut iterations = 0usize;

        loop {
            iterations += 1;
            let chunk = self.process_chunk(tenant_id, event, key, handler, tick_start).await?;
            let full = chunk.selected >= event.chunk_size;
            summary += chunk;

            if !event.check_next_chunk || !full {
                break;
            }
            if started.elapsed() >= budget {
                info!(
                    tenant_id = %tenant_id,
                    event = %key,
                    iterations,
                    "tick interval used up, remaining entries wait for the next tick"
                );
                break;
            }
        }
        Ok(summary)
    }

    async fn process_chunk(
        &self,
        tenant_id: TenantId,
        event: &EventConfig,
        key: &EventKey,
        handler: &dyn EventHandler<P::Tx>,
        tick_start: DateTime<Utc>,
    ) -> Result<TickSummary, StoreError> {
        let query = selector::select_query(&self.config, event, tick_start);
        let selection = selector::select(self.store.as_ref(), tenant_id, &query).await?;
        if selection.is_empty() {
            debug!(tenant_id = %tenant_id, event = %key, "nothing due");
            return Ok(TickSummary::default());
        }

        let mut summary = TickSummary {
            selected: selection.len(),
            exceeded: selection.exceeded.len(),
            ..TickSummary::default()
        };
        selector::handle_exceeded(
            &self.store,
            &self.transactions,
            handler,
            tenant_id,
            key,
            &selection.exceeded,
        )
        .await;
        if selection.due.is_empty() {
            return Ok(summary);
        }

        // Fresh per-chunk context: nothing below outlives this call.
        let selected = SelectedEntries::new(&selection.due);
        let keepalive = Keepalive::new(
            Arc::clone(&self.store),
            tenant_id,
            self.config.row_lock_wait(),
            event.stale_check,
            selected.clone(),
        );
        let mut aggregator = StatusAggregator::new(
            Arc::clone(&self.store),
            tenant_id,
            key.clone(),
            selected,
            event.commit_per_unit,
        );

        let units = clustering::cluster(
            &self.transactions,
            handler,
            tenant_id,
            key,
            &selection.due,
            &mut aggregator,
        )
        .await;

        let scope = UnitScope {
            tenant_id,
            event,
            key,
            transactions: &self.transactions,
            handler,
            keepalive: &keepalive,
        };
        scope.dispatch(units, &mut aggregator).await;

        let counts = aggregator.finish().await;
        summary.done = counts.done;
        summary.failed = counts.failed;
        summary.requeued = counts.requeued;
        summary.stale = counts.stale;

        info!(
            tenant_id = %tenant_id,
            event = %key,
            selected = summary.selected,
            exceeded = summary.exceeded,
            done = summary.done,
            failed = summary.failed,
            requeued = summary.requeued,
            stale = summary.stale,
            "chunk processed"
        );
        Ok(summary)
    }
}
