//! Integration tests for the full processing pipeline.
//!
//! Tests: Scheduler → Engine → Selector → Clustering → Dispatch → Aggregator → Store
//!
//! Verifies:
//! - Every selected entry ends the tick with exactly one persisted status
//! - Retry budgets, requeues and orphan reclaim follow the status lifecycle
//! - Stale units, handler failures and protocol violations stay contained
//! - Transactions, parallelism and locks behave per event configuration
//! - Scheduler topologies coordinate instances and tenants

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{Value as JsonValue, json};

    use rowqueue_core::{
        ClusterKey, EntryId, EntryStatus, EventKey, NewEntry, ProcessingUnit, QueueEntry, TenantId,
        Verdict, now_micros,
    };

    use crate::config::{EngineConfig, EventConfig};
    use crate::engine::{
        Engine, EventHandler, NoopTransactions, TransactionProvider, UnitContext, parse_payload,
    };
    use crate::error::{HandlerError, StoreError};
    use crate::lock::{CacheLock, DistributedLock, InMemoryLockCache, InMemoryLockTable, LockKey, RelationalLock};
    use crate::scheduler::{Scheduler, StaticTenants, Topology};
    use crate::store::{InMemoryQueueStore, LeaseCheck, QueueStore, SelectQuery, Selection, StatusBatch};

    fn mail() -> EventKey {
        EventKey::new("Mail", "Send")
    }

    /// What the handler saw.
    #[derive(Default)]
    struct Seen {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        exceeded: Mutex<Vec<Vec<EntryId>>>,
    }

    /// Handler scripted by entry payloads:
    ///
    /// - `verdicts`: statuses to report for the entry, in order (default `["done"]`);
    ///   `"none"` reports nothing, `"foreign"` reports for an unknown entry
    /// - `fail`: return an error for the whole unit
    /// - `panic`: panic while processing the unit
    /// - `panic_check`: panic while checking the payload
    /// - `skip`: the payload check reports nothing to do
    /// - `group`: cluster key
    /// - `delay_ms`: time spent in the handler
    /// - `touch`: overwrite the row as another worker would, then keepalive
    #[derive(Clone, Default)]
    struct Scripted {
        seen: Arc<Seen>,
        store: Option<Arc<InMemoryQueueStore>>,
    }

    impl Scripted {
        fn touching(store: Arc<InMemoryQueueStore>) -> Self {
            Self {
                seen: Arc::default(),
                store: Some(store),
            }
        }

        fn calls(&self) -> usize {
            self.seen.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<Tx: Send + Sync + 'static> EventHandler<Tx> for Scripted {
        async fn check_payload(
            &self,
            _tx: &mut Tx,
            entry: &QueueEntry,
        ) -> Result<Option<JsonValue>, HandlerError> {
            let payload = parse_payload(entry)?;
            if payload["panic_check"] == json!(true) {
                panic!("payload check crashed for {}", entry.id);
            }
            if payload["skip"] == json!(true) {
                return Ok(None);
            }
            Ok(Some(payload))
        }

        fn cluster_key(&self, entry: &QueueEntry, payload: &JsonValue) -> Result<ClusterKey, HandlerError> {
            Ok(payload["group"]
                .as_str()
                .map(ClusterKey::from)
                .unwrap_or_else(|| ClusterKey::from(entry.id)))
        }

        async fn process(
            &self,
            ctx: &mut UnitContext<'_, Tx>,
            unit: &ProcessingUnit,
        ) -> Result<Vec<Verdict>, HandlerError> {
            self.seen.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.seen.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.max_running.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = unit.payload["delay_ms"].as_u64() {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.seen.running.fetch_sub(1, Ordering::SeqCst);

            let mut verdicts = Vec::new();
            for entry in &unit.entries {
                let payload = parse_payload(entry)?;
                if payload["fail"] == json!(true) {
                    return Err(anyhow::anyhow!("downstream rejected {}", entry.id).into());
                }
                if payload["panic"] == json!(true) {
                    panic!("mailer crashed on {}", entry.id);
                }
                if payload["touch"] == json!(true) {
                    if let Some(store) = &self.store {
                        store
                            .touch(entry.id, now_micros() + chrono::Duration::seconds(1))
                            .await
                            .map_err(anyhow::Error::from)?;
                    }
                    ctx.keepalive(&[entry.id]).await;
                }
                let script = payload["verdicts"]
                    .as_array()
                    .cloned()
                    .unwrap_or_else(|| vec![json!("done")]);
                for step in script {
                    match step.as_str() {
                        Some("done") => verdicts.push(Verdict::done(entry.id)),
                        Some("error") => verdicts.push(Verdict::error(entry.id)),
                        Some("open") => verdicts.push(Verdict::requeue(entry.id)),
                        Some("in_progress") => verdicts.push(Verdict::new(entry.id, EntryStatus::InProgress)),
                        Some("foreign") => verdicts.push(Verdict::done(EntryId::new())),
                        _ => {}
                    }
                }
            }
            Ok(verdicts)
        }

        async fn on_exceeded(&self, _tx: &mut Tx, entries: &[QueueEntry]) -> Result<(), HandlerError> {
            self.seen
                .exceeded
                .lock()
                .unwrap()
                .push(entries.iter().map(|e| e.id).collect());
            Ok(())
        }
    }

    /// Records every transaction call.
    #[derive(Clone, Default)]
    struct RecordingTransactions {
        log: Arc<Mutex<Vec<&'static str>>>,
        next: Arc<AtomicUsize>,
    }

    impl RecordingTransactions {
        fn count(&self, call: &str) -> usize {
            self.log.lock().unwrap().iter().filter(|c| **c == call).count()
        }
    }

    #[async_trait]
    impl TransactionProvider for RecordingTransactions {
        type Tx = usize;

        async fn begin(&self, _tenant_id: TenantId) -> Result<usize, HandlerError> {
            self.log.lock().unwrap().push("begin");
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        async fn commit(&self, _tx: usize) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push("commit");
            Ok(())
        }

        async fn rollback(&self, _tx: usize) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    /// Store with injected faults: selection fails for a broken tenant, and
    /// status writes touching a refused entry fail.
    struct FaultyStore {
        inner: Arc<InMemoryQueueStore>,
        broken: Option<TenantId>,
        refused: Option<EntryId>,
    }

    #[async_trait]
    impl QueueStore for FaultyStore {
        async fn enqueue(&self, entries: Vec<NewEntry>) -> Result<Vec<EntryId>, StoreError> {
            self.inner.enqueue(entries).await
        }

        async fn select_due(&self, tenant_id: TenantId, query: &SelectQuery) -> Result<Selection, StoreError> {
            if Some(tenant_id) == self.broken {
                return Err(StoreError::Database("connection refused".to_string()));
            }
            self.inner.select_due(tenant_id, query).await
        }

        async fn mark_exceeded(&self, tenant_id: TenantId, ids: &[EntryId]) -> Result<(), StoreError> {
            self.inner.mark_exceeded(tenant_id, ids).await
        }

        async fn keepalive(
            &self,
            tenant_id: TenantId,
            expected: &[(EntryId, DateTime<Utc>)],
            lock_wait: Duration,
        ) -> Result<LeaseCheck, StoreError> {
            self.inner.keepalive(tenant_id, expected, lock_wait).await
        }

        async fn persist_statuses(&self, tenant_id: TenantId, batch: &StatusBatch) -> Result<(), StoreError> {
            if let Some(refused) = self.refused {
                let mut ids = batch.done.iter().chain(&batch.failed).chain(&batch.requeued);
                if ids.any(|id| *id == refused) {
                    return Err(StoreError::Database("write conflict".to_string()));
                }
            }
            self.inner.persist_statuses(tenant_id, batch).await
        }

        async fn get(&self, tenant_id: TenantId, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
            self.inner.get(tenant_id, id).await
        }
    }

    fn memory_lock() -> Arc<dyn DistributedLock> {
        Arc::new(CacheLock::new(InMemoryLockCache::new()))
    }

    fn config(event: EventConfig) -> EngineConfig {
        EngineConfig::default().with_events(vec![event]).unwrap()
    }

    fn engine<P, H>(
        config: EngineConfig,
        store: Arc<dyn QueueStore>,
        lock: Arc<dyn DistributedLock>,
        transactions: P,
        handler: H,
    ) -> Engine<P>
    where
        P: TransactionProvider,
        H: EventHandler<P::Tx> + 'static,
    {
        rowqueue_observability::init();
        let key = config.events[0].key();
        let mut engine = Engine::new(Arc::new(config), store, lock, transactions);
        engine.register(key, handler).unwrap();
        engine
    }

    async fn enqueue<P: TransactionProvider>(
        engine: &Engine<P>,
        tenant_id: TenantId,
        payloads: &[JsonValue],
    ) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let entry = NewEntry::with_json(tenant_id, &mail(), payload);
            ids.extend(engine.enqueue(vec![entry]).await.unwrap());
        }
        ids
    }

    async fn stored(store: &InMemoryQueueStore, tenant_id: TenantId, id: EntryId) -> QueueEntry {
        store.get(tenant_id, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn missing_verdict_is_persisted_as_error() {
        let store = InMemoryQueueStore::arc();
        let handler = Scripted::default();
        let engine = engine(config(EventConfig::new("Mail", "Send")), store.clone(), memory_lock(), NoopTransactions, handler);
        let tenant_id = TenantId::new();
        let ids = enqueue(
            &engine,
            tenant_id,
            &[
                json!({"verdicts": ["done"]}),
                json!({"verdicts": ["none"]}),
                json!({"verdicts": ["error"]}),
            ],
        )
        .await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.selected, 3);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(stored(&store, tenant_id, ids[0]).await.status, EntryStatus::Done);
        assert_eq!(stored(&store, tenant_id, ids[1]).await.status, EntryStatus::Error);
        assert_eq!(stored(&store, tenant_id, ids[2]).await.status, EntryStatus::Error);
    }

    #[tokio::test]
    async fn worst_status_wins_regardless_of_order() {
        let store = InMemoryQueueStore::arc();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(
            &engine,
            tenant_id,
            &[
                json!({"verdicts": ["done", "error"]}),
                json!({"verdicts": ["error", "done"]}),
            ],
        )
        .await;

        engine.run_tenant(tenant_id).await.unwrap();

        for id in ids {
            assert_eq!(stored(&store, tenant_id, id).await.status, EntryStatus::Error);
        }
    }

    #[tokio::test]
    async fn exhausted_entry_goes_to_exceeded_hook_once() {
        let store = InMemoryQueueStore::arc();
        let handler = Scripted::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send").with_retry_limit(2)),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            handler.clone(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(&engine, tenant_id, &[json!({"verdicts": ["error"]})]).await;

        for attempt in 1..=2u32 {
            engine.run_tenant(tenant_id).await.unwrap();
            let entry = stored(&store, tenant_id, ids[0]).await;
            assert_eq!((entry.status, entry.attempts), (EntryStatus::Error, attempt));
        }
        assert_eq!(handler.calls(), 2);

        let summary = engine.run_tenant(tenant_id).await.unwrap();
        assert_eq!(summary.exceeded, 1);
        assert_eq!(handler.calls(), 2);
        let entry = stored(&store, tenant_id, ids[0]).await;
        assert_eq!((entry.status, entry.attempts), (EntryStatus::Exceeded, 2));
        assert_eq!(*handler.seen.exceeded.lock().unwrap(), vec![vec![ids[0]]]);

        let summary = engine.run_tenant(tenant_id).await.unwrap();
        assert_eq!(summary.selected, 0);
        assert_eq!(handler.seen.exceeded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requeue_gives_back_the_attempt_once() {
        let store = InMemoryQueueStore::arc();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(&engine, tenant_id, &[json!({"verdicts": ["open", "open"]})]).await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.requeued, 1);
        let entry = stored(&store, tenant_id, ids[0]).await;
        assert_eq!((entry.status, entry.attempts), (EntryStatus::Open, 0));
    }

    #[tokio::test]
    async fn externally_touched_entry_gets_no_status_write() {
        let store = InMemoryQueueStore::arc();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::touching(store.clone()),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(&engine, tenant_id, &[json!({"touch": true}), json!({})]).await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.stale, 1);
        assert_eq!(summary.done, 1);
        let touched = stored(&store, tenant_id, ids[0]).await;
        assert_eq!((touched.status, touched.attempts), (EntryStatus::InProgress, 1));
        assert_eq!(stored(&store, tenant_id, ids[1]).await.status, EntryStatus::Done);
    }

    #[tokio::test]
    async fn disallowed_and_foreign_verdicts_are_dropped() {
        let store = InMemoryQueueStore::arc();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(
            &engine,
            tenant_id,
            &[json!({"verdicts": ["in_progress", "foreign", "done"]})],
        )
        .await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(stored(&store, tenant_id, ids[0]).await.status, EntryStatus::Done);
    }

    #[tokio::test]
    async fn handler_error_fails_only_its_unit() {
        let store = InMemoryQueueStore::arc();
        let engine = engine(
            config(EventConfig::new("Mail", "Send").with_parallelism(3)),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(
            &engine,
            tenant_id,
            &[
                json!({"fail": true, "group": "a"}),
                json!({"group": "a"}),
                json!({"group": "b"}),
            ],
        )
        .await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.done, 1);
        assert_eq!(stored(&store, tenant_id, ids[0]).await.status, EntryStatus::Error);
        assert_eq!(stored(&store, tenant_id, ids[1]).await.status, EntryStatus::Error);
        assert_eq!(stored(&store, tenant_id, ids[2]).await.status, EntryStatus::Done);
    }

    #[tokio::test]
    async fn handler_panic_fails_only_its_unit() {
        let store = InMemoryQueueStore::arc();
        let engine = engine(
            config(EventConfig::new("Mail", "Send").with_parallelism(2)),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(
            &engine,
            tenant_id,
            &[json!({"panic": true}), json!({}), json!({"panic_check": true})],
        )
        .await;

        let summary = tokio::spawn(async move { engine.run_tenant(tenant_id).await })
            .await
            .expect("tick must not panic")
            .unwrap();

        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(stored(&store, tenant_id, ids[0]).await.status, EntryStatus::Error);
        assert_eq!(stored(&store, tenant_id, ids[1]).await.status, EntryStatus::Done);
        assert_eq!(stored(&store, tenant_id, ids[2]).await.status, EntryStatus::Error);
    }

    #[tokio::test]
    async fn dispatch_never_exceeds_parallelism() {
        let store = InMemoryQueueStore::arc();
        let handler = Scripted::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send").with_parallelism(3)),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            handler.clone(),
        );
        let tenant_id = TenantId::new();
        let payloads: Vec<JsonValue> = (0..8).map(|_| json!({"delay_ms": 30})).collect();
        enqueue(&engine, tenant_id, &payloads).await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.done, 8);
        assert_eq!(handler.calls(), 8);
        assert_eq!(handler.seen.max_running.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn serial_mode_shares_one_transaction() {
        let store = InMemoryQueueStore::arc();
        let transactions = RecordingTransactions::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            transactions.clone(),
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        enqueue(&engine, tenant_id, &[json!({}), json!({}), json!({})]).await;

        engine.run_tenant(tenant_id).await.unwrap();

        // Check transaction (always rolled back) plus one shared transaction.
        assert_eq!(transactions.count("begin"), 2);
        assert_eq!(transactions.count("commit"), 1);
        assert_eq!(transactions.count("rollback"), 1);
    }

    #[tokio::test]
    async fn serial_mode_rolls_back_when_any_entry_fails() {
        let store = InMemoryQueueStore::arc();
        let transactions = RecordingTransactions::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            transactions.clone(),
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        enqueue(&engine, tenant_id, &[json!({}), json!({"verdicts": ["error"]})]).await;

        engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(transactions.count("begin"), 2);
        assert_eq!(transactions.count("commit"), 0);
        assert_eq!(transactions.count("rollback"), 2);
    }

    #[tokio::test]
    async fn per_unit_mode_commits_each_unit() {
        let store = InMemoryQueueStore::arc();
        let transactions = RecordingTransactions::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send").with_commit_per_unit(true)),
            store.clone(),
            memory_lock(),
            transactions.clone(),
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(&engine, tenant_id, &[json!({}), json!({}), json!({})]).await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.done, 3);
        assert_eq!(transactions.count("begin"), 4);
        assert_eq!(transactions.count("commit"), 3);
        assert_eq!(transactions.count("rollback"), 1);
        for id in ids {
            assert_eq!(stored(&store, tenant_id, id).await.status, EntryStatus::Done);
        }
    }

    #[tokio::test]
    async fn per_unit_write_failure_leaves_other_units_committed() {
        let inner = InMemoryQueueStore::arc();
        let tenant_id = TenantId::new();
        let ids = inner
            .enqueue(
                (0..3)
                    .map(|_| NewEntry::with_json(tenant_id, &mail(), &json!({})))
                    .collect(),
            )
            .await
            .unwrap();
        let store = Arc::new(FaultyStore {
            inner: inner.clone(),
            broken: None,
            refused: Some(ids[1]),
        });
        let engine = engine(
            config(EventConfig::new("Mail", "Send").with_commit_per_unit(true)),
            store,
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.done, 2);
        assert_eq!(stored(&inner, tenant_id, ids[0]).await.status, EntryStatus::Done);
        assert_eq!(stored(&inner, tenant_id, ids[1]).await.status, EntryStatus::InProgress);
        assert_eq!(stored(&inner, tenant_id, ids[2]).await.status, EntryStatus::Done);
    }

    #[tokio::test]
    async fn payload_without_work_is_done_without_dispatch() {
        let store = InMemoryQueueStore::arc();
        let handler = Scripted::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            handler.clone(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(&engine, tenant_id, &[json!({"skip": true})]).await;

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.done, 1);
        assert_eq!(handler.calls(), 0);
        assert_eq!(stored(&store, tenant_id, ids[0]).await.status, EntryStatus::Done);
    }

    #[tokio::test]
    async fn done_entries_are_never_reselected() {
        let store = InMemoryQueueStore::arc();
        let handler = Scripted::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            handler.clone(),
        );
        let tenant_id = TenantId::new();
        enqueue(&engine, tenant_id, &[json!({})]).await;

        assert_eq!(engine.run_tenant(tenant_id).await.unwrap().done, 1);
        assert_eq!(engine.run_tenant(tenant_id).await.unwrap().selected, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn orphaned_in_progress_entry_is_reclaimed() {
        let store = InMemoryQueueStore::arc();
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        let tenant_id = TenantId::new();
        let now = now_micros();
        let in_progress = |last_attempt_at: DateTime<Utc>| {
            let mut entry = NewEntry::with_json(tenant_id, &mail(), &json!({}))
                .into_entry(now - chrono::Duration::hours(2))
                .unwrap();
            entry.status = EntryStatus::InProgress;
            entry.attempts = 1;
            entry.last_attempt_at = Some(last_attempt_at);
            entry
        };
        let orphan = store.insert(in_progress(now - chrono::Duration::minutes(31))).await.unwrap();
        let alive = store.insert(in_progress(now - chrono::Duration::minutes(5))).await.unwrap();

        let summary = engine.run_tenant(tenant_id).await.unwrap();

        assert_eq!(summary.selected, 1);
        let reclaimed = stored(&store, tenant_id, orphan).await;
        assert_eq!((reclaimed.status, reclaimed.attempts), (EntryStatus::Done, 2));
        let untouched = stored(&store, tenant_id, alive).await;
        assert_eq!((untouched.status, untouched.attempts), (EntryStatus::InProgress, 1));
    }

    #[tokio::test]
    async fn next_chunk_loop_drains_full_chunks() {
        let tenant_id = TenantId::new();
        let payloads: Vec<JsonValue> = (0..5).map(|_| json!({})).collect();

        let store = InMemoryQueueStore::arc();
        let single = engine(
            config(EventConfig::new("Mail", "Send").with_chunk_size(2)),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        enqueue(&single, tenant_id, &payloads).await;
        assert_eq!(single.run_tenant(tenant_id).await.unwrap().done, 2);

        let store = InMemoryQueueStore::arc();
        let looping = engine(
            config(
                EventConfig::new("Mail", "Send")
                    .with_chunk_size(2)
                    .with_check_next_chunk(true),
            ),
            store.clone(),
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        enqueue(&looping, tenant_id, &payloads).await;
        let summary = looping.run_tenant(tenant_id).await.unwrap();
        assert_eq!(summary.selected, 5);
        assert_eq!(summary.done, 5);
    }

    #[tokio::test]
    async fn non_concurrent_event_is_skipped_while_locked() {
        let store = InMemoryQueueStore::arc();
        let lock = memory_lock();
        let handler = Scripted::default();
        let engine = engine(
            config(EventConfig::new("Mail", "Send").with_concurrent_processing(false)),
            store.clone(),
            lock.clone(),
            NoopTransactions,
            handler.clone(),
        );
        let tenant_id = TenantId::new();
        let ids = enqueue(&engine, tenant_id, &[json!({})]).await;

        let held = LockKey::tenant(tenant_id, mail().to_string());
        assert!(lock.acquire(&held, Duration::from_secs(60)).await.unwrap());
        let summary = engine.run_tenant(tenant_id).await.unwrap();
        assert_eq!(summary.selected, 0);
        let entry = stored(&store, tenant_id, ids[0]).await;
        assert_eq!((entry.status, entry.attempts), (EntryStatus::Open, 0));

        lock.release(&held).await.unwrap();
        assert_eq!(engine.run_tenant(tenant_id).await.unwrap().done, 1);
        assert_eq!(handler.calls(), 1);
        // Released again after processing.
        assert!(lock.acquire(&held, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn multi_instance_multi_tenant_processes_each_tenant_once() {
        let store = InMemoryQueueStore::arc();
        let lock: Arc<dyn DistributedLock> = Arc::new(RelationalLock::new(InMemoryLockTable::new()));
        let handler = Scripted::default();
        let (first, second) = (TenantId::new(), TenantId::new());
        let tenants = Arc::new(StaticTenants::new(vec![first, second]));

        let instances: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine(
                    config(EventConfig::new("Mail", "Send")),
                    store.clone(),
                    lock.clone(),
                    NoopTransactions,
                    handler.clone(),
                );
                Scheduler::new(
                    Arc::new(engine),
                    Topology::MultiInstanceMultiTenant {
                        tenants: tenants.clone(),
                    },
                )
            })
            .collect();
        enqueue(instances[0].engine(), first, &[json!({})]).await;
        enqueue(instances[0].engine(), second, &[json!({})]).await;

        let (a, b) = tokio::join!(instances[0].run_once(), instances[1].run_once());

        let mut processed: Vec<TenantId> = a.iter().chain(b.iter()).map(|(t, _)| *t).collect();
        processed.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(processed, expected);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn single_instance_multi_tenant_survives_a_failing_tenant() {
        let inner = InMemoryQueueStore::arc();
        let (broken, healthy) = (TenantId::new(), TenantId::new());
        let store = Arc::new(FaultyStore {
            inner: inner.clone(),
            broken: Some(broken),
            refused: None,
        });
        let engine = engine(
            config(EventConfig::new("Mail", "Send")),
            store,
            memory_lock(),
            NoopTransactions,
            Scripted::default(),
        );
        let ids = enqueue(&engine, healthy, &[json!({})]).await;
        enqueue(&engine, broken, &[json!({})]).await;
        let scheduler = Scheduler::new(
            Arc::new(engine),
            Topology::SingleInstanceMultiTenant {
                tenants: Arc::new(StaticTenants::new(vec![broken, healthy])),
            },
        );

        let processed = scheduler.run_once().await;

        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].0, healthy);
        assert_eq!(stored(&inner, healthy, ids[0]).await.status, EntryStatus::Done);
    }

    #[tokio::test]
    async fn spawned_scheduler_ticks_until_shutdown() {
        let store = InMemoryQueueStore::arc();
        let config = config(EventConfig::new("Mail", "Send"))
            .with_startup_delay(Duration::ZERO)
            .with_run_interval(Duration::from_millis(20));
        let engine = engine(config, store.clone(), memory_lock(), NoopTransactions, Scripted::default());
        let tenant_id = TenantId::new();
        let ids = enqueue(&engine, tenant_id, &[json!({})]).await;

        let handle = Scheduler::new(
            Arc::new(engine),
            Topology::SingleInstanceSingleTenant { tenant_id },
        )
        .spawn();

        let mut status = EntryStatus::Open;
        for _ in 0..100 {
            status = stored(&store, tenant_id, ids[0]).await.status;
            if status == EntryStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(status, EntryStatus::Done);
    }
}
