//! Infrastructure layer: configuration, queue store, distributed lock, the
//! processing engine and the scheduler driving it.

pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{EngineConfig, EventConfig, LockBackend, TopologyConfig};
pub use engine::{Engine, EventHandler, TickSummary, TransactionProvider, UnitContext};
pub use error::{ConfigError, HandlerError, LockError, RegistryError, StoreError};
pub use scheduler::{Scheduler, SchedulerHandle, StaticTenants, TenantDirectory, Topology};
