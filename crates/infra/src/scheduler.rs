//! Periodic runner over the four deployment topologies.
//!
//! | instances | tenants | coordination                                      |
//! |-----------|---------|---------------------------------------------------|
//! | single    | single  | none                                              |
//! | single    | multi   | none, tenants in sequence                         |
//! | multi     | single  | row locks taken by selection                      |
//! | multi     | multi   | shared run id, then one tenant lock per run id    |
//!
//! A tick never overlaps itself: the next one is armed only after the
//! previous one completed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rowqueue_core::TenantId;

use crate::config::TopologyConfig;
use crate::engine::{Engine, TickSummary, TransactionProvider};
use crate::lock::LockKey;

/// Global lock holding the id of the current multi-instance run.
pub const RUN_ID_LOCK: &str = "EVENT_QUEUE_RUN_ID";

/// Source of the tenants to process each tick.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenants(&self) -> anyhow::Result<Vec<TenantId>>;
}

/// Fixed tenant list.
#[derive(Debug, Clone, Default)]
pub struct StaticTenants {
    tenants: Vec<TenantId>,
}

impl StaticTenants {
    pub fn new(tenants: Vec<TenantId>) -> Self {
        Self { tenants }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenants {
    async fn tenants(&self) -> anyhow::Result<Vec<TenantId>> {
        Ok(self.tenants.clone())
    }
}

/// Deployment shape with what each shape needs to run.
#[derive(Clone)]
pub enum Topology {
    SingleInstanceSingleTenant { tenant_id: TenantId },
    SingleInstanceMultiTenant { tenants: Arc<dyn TenantDirectory> },
    MultiInstanceSingleTenant { tenant_id: TenantId },
    MultiInstanceMultiTenant { tenants: Arc<dyn TenantDirectory> },
}

impl core::fmt::Debug for Topology {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SingleInstanceSingleTenant { tenant_id } => f
                .debug_struct("SingleInstanceSingleTenant")
                .field("tenant_id", tenant_id)
                .finish(),
            Self::SingleInstanceMultiTenant { .. } => f.write_str("SingleInstanceMultiTenant"),
            Self::MultiInstanceSingleTenant { tenant_id } => f
                .debug_struct("MultiInstanceSingleTenant")
                .field("tenant_id", tenant_id)
                .finish(),
            Self::MultiInstanceMultiTenant { .. } => f.write_str("MultiInstanceMultiTenant"),
        }
    }
}

impl Topology {
    /// Pick the topology the configuration asks for. Single-tenant shapes
    /// run `tenant_id`; multi-tenant shapes ask `tenants` every tick.
    pub fn from_config(
        config: &TopologyConfig,
        tenant_id: TenantId,
        tenants: Arc<dyn TenantDirectory>,
    ) -> Self {
        match (config.multi_instance, config.multi_tenant) {
            (false, false) => Self::SingleInstanceSingleTenant { tenant_id },
            (false, true) => Self::SingleInstanceMultiTenant { tenants },
            (true, false) => Self::MultiInstanceSingleTenant { tenant_id },
            (true, true) => Self::MultiInstanceMultiTenant { tenants },
        }
    }
}

/// Drives the engine periodically.
pub struct Scheduler<P: TransactionProvider> {
    engine: Arc<Engine<P>>,
    topology: Topology,
}

impl<P: TransactionProvider> Scheduler<P> {
    pub fn new(engine: Arc<Engine<P>>, topology: Topology) -> Self {
        Self { engine, topology }
    }

    pub fn engine(&self) -> &Arc<Engine<P>> {
        &self.engine
    }

    /// Run one tick. Never fails: every error is logged and contained.
    ///
    /// Returns the tenants this instance processed.
    pub async fn run_once(&self) -> Vec<(TenantId, TickSummary)> {
        match &self.topology {
            Topology::SingleInstanceSingleTenant { tenant_id }
            | Topology::MultiInstanceSingleTenant { tenant_id } => {
                self.run_tenant(*tenant_id).await.into_iter().collect()
            }
            Topology::SingleInstanceMultiTenant { tenants } => {
                let mut processed = Vec::new();
                for tenant_id in discover(tenants.as_ref()).await {
                    processed.extend(self.run_tenant(tenant_id).await);
                }
                processed
            }
            Topology::MultiInstanceMultiTenant { tenants } => self.run_coordinated(tenants.as_ref()).await,
        }
    }

    async fn run_tenant(&self, tenant_id: TenantId) -> Option<(TenantId, TickSummary)> {
        match self.engine.run_tenant(tenant_id).await {
            Ok(summary) => Some((tenant_id, summary)),
            Err(err) => {
                error!(tenant_id = %tenant_id, error = %err, "tenant tick failed");
                None
            }
        }
    }

    async fn run_coordinated(&self, tenants: &dyn TenantDirectory) -> Vec<(TenantId, TickSummary)> {
        let interval = self.engine.config().run_interval();
        let Some(run_id) = self.elect_run_id(interval.mul_f64(0.9)).await else {
            return Vec::new();
        };

        let lock = self.engine.lock();
        let mut processed = Vec::new();
        for tenant_id in discover(tenants).await {
            let key = LockKey::tenant(tenant_id, format!("{RUN_ID_LOCK}##{run_id}"));
            match lock.acquire(&key, interval).await {
                Ok(true) => processed.extend(self.run_tenant(tenant_id).await),
                Ok(false) => {
                    debug!(tenant_id = %tenant_id, run_id = %run_id, "tenant taken by another instance");
                }
                Err(err) => {
                    warn!(tenant_id = %tenant_id, error = %err, "could not take tenant lock, skipping");
                }
            }
        }
        processed
    }

    /// First writer wins; everybody else adopts the stored id.
    async fn elect_run_id(&self, ttl: Duration) -> Option<String> {
        let lock = self.engine.lock();
        let key = LockKey::global(RUN_ID_LOCK);
        let candidate = Uuid::new_v4().to_string();

        match lock.set_value_with_expire(&key, &candidate, ttl).await {
            Ok(true) => {
                debug!(run_id = %candidate, "run id elected");
                Some(candidate)
            }
            Ok(false) => match lock.check_value(&key).await {
                Ok(Some(run_id)) => Some(run_id),
                Ok(None) => {
                    warn!("run id expired before it could be read, skipping tick");
                    None
                }
                Err(err) => {
                    error!(error = %err, "failed to read run id, skipping tick");
                    None
                }
            },
            Err(err) => {
                error!(error = %err, "failed to elect run id, skipping tick");
                None
            }
        }
    }
}

async fn discover(tenants: &dyn TenantDirectory) -> Vec<TenantId> {
    match tenants.tenants().await {
        Ok(tenants) => tenants,
        Err(err) => {
            error!(error = %err, "tenant discovery failed, skipping tick");
            Vec::new()
        }
    }
}

impl<P: TransactionProvider> Scheduler<P> {
    /// Start ticking in the background: first after the startup delay, then
    /// `run_interval` after each completed tick.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let config = Arc::clone(self.engine.config());
        let (startup_delay, interval) = (config.startup_delay(), config.run_interval());

        let join = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(startup_delay) => {}
                _ = stop.changed() => return,
            }
            loop {
                match AssertUnwindSafe(self.run_once()).catch_unwind().await {
                    Ok(processed) => info!(tenants = processed.len(), "tick finished"),
                    Err(_) => error!("tick panicked, next tick is scheduled as usual"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.changed() => break,
                }
            }
        });

        SchedulerHandle { shutdown, join }
    }
}

/// Handle to stop a spawned scheduler. Dropping it stops the loop too.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the running tick, if any, and wait for the loop to exit.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("scheduler loop already stopped");
        }
        if let Err(err) = self.join.await {
            error!(error = %err, "scheduler task ended abnormally");
        }
    }
}
