//! Handler capability set and registry.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value as JsonValue;

use rowqueue_core::{ClusterKey, EntryId, EventKey, ProcessingUnit, QueueEntry, TenantId, Verdict};

use super::keepalive::{Keepalive, KeepaliveOutcome};
use crate::error::{HandlerError, RegistryError};

/// Domain logic for one `(type, sub_type)`.
///
/// Only [`process`](EventHandler::process) is required. Handlers must be
/// idempotent: delivery is at-least-once.
#[async_trait]
pub trait EventHandler<Tx: Send>: Send + Sync {
    /// Validate an entry and produce the payload used for clustering.
    ///
    /// Runs in a transaction that is always rolled back. `Ok(None)` marks the
    /// entry done without dispatching it; an error marks only this entry as
    /// failed. The default parses the stored payload as JSON (absent
    /// payloads become `null`).
    async fn check_payload(
        &self,
        _tx: &mut Tx,
        entry: &QueueEntry,
    ) -> Result<Option<JsonValue>, HandlerError> {
        parse_payload(entry).map(Some)
    }

    /// Grouping key. Entries sharing a key are processed as one unit.
    fn cluster_key(&self, entry: &QueueEntry, _payload: &JsonValue) -> Result<ClusterKey, HandlerError> {
        Ok(ClusterKey::from(entry.id))
    }

    /// Mass preload after clustering, before any unit is dispatched.
    ///
    /// Shares the rolled-back check transaction; may rewrite unit payloads.
    async fn before_processing(
        &self,
        _tx: &mut Tx,
        _units: &mut [ProcessingUnit],
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Process one unit and report a verdict per entry.
    async fn process(
        &self,
        ctx: &mut UnitContext<'_, Tx>,
        unit: &ProcessingUnit,
    ) -> Result<Vec<Verdict>, HandlerError>;

    /// Called once per batch of entries whose retries are exhausted.
    /// The transaction is committed unless this returns an error.
    async fn on_exceeded(&self, _tx: &mut Tx, _entries: &[QueueEntry]) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Default payload decoding.
pub fn parse_payload(entry: &QueueEntry) -> Result<JsonValue, HandlerError> {
    match entry.payload.as_deref() {
        None => Ok(JsonValue::Null),
        Some(raw) => serde_json::from_str(raw).map_err(|e| HandlerError::InvalidPayload {
            id: entry.id,
            reason: e.to_string(),
        }),
    }
}

/// Run a handler call, turning a panic into [`HandlerError::Panicked`].
pub(crate) async fn guarded<T, F>(call: F) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Synchronous counterpart of [`guarded`].
pub(crate) fn guarded_sync<T>(call: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Everything a handler may touch while processing one unit.
///
/// The transaction belongs to this unit alone unless the event runs in
/// plain serial mode, where all units of the tick share it.
pub struct UnitContext<'a, Tx> {
    tenant_id: TenantId,
    event: &'a EventKey,
    cluster_key: &'a ClusterKey,
    tx: &'a mut Tx,
    keepalive: &'a Keepalive,
}

impl<'a, Tx> UnitContext<'a, Tx> {
    pub(crate) fn new(
        tenant_id: TenantId,
        event: &'a EventKey,
        cluster_key: &'a ClusterKey,
        tx: &'a mut Tx,
        keepalive: &'a Keepalive,
    ) -> Self {
        Self {
            tenant_id,
            event,
            cluster_key,
            tx,
            keepalive,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn event(&self) -> &EventKey {
        self.event
    }

    pub fn cluster_key(&self) -> &ClusterKey {
        self.cluster_key
    }

    pub fn tx(&mut self) -> &mut Tx {
        &mut *self.tx
    }

    /// Extend the lease of entries during long processing.
    ///
    /// A `Stale` outcome means another writer touched them: stop working on
    /// them, no status will be persisted for them this tick.
    pub async fn keepalive(&self, ids: &[EntryId]) -> KeepaliveOutcome {
        self.keepalive.check(ids).await
    }
}

/// Handlers keyed by `(type, sub_type)`.
pub struct HandlerRegistry<Tx: Send> {
    handlers: HashMap<EventKey, Arc<dyn EventHandler<Tx>>>,
}

impl<Tx: Send + 'static> HandlerRegistry<Tx> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<H>(&mut self, key: EventKey, handler: H) -> Result<(), RegistryError>
    where
        H: EventHandler<Tx> + 'static,
    {
        self.register_arc(key, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        key: EventKey,
        handler: Arc<dyn EventHandler<Tx>>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&key) {
            return Err(RegistryError::DuplicateHandler(key));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, key: &EventKey) -> Option<Arc<dyn EventHandler<Tx>>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EventKey> {
        self.handlers.keys()
    }
}

impl<Tx: Send + 'static> Default for HandlerRegistry<Tx> {
    fn default() -> Self {
        Self::new()
    }
}
