//! Processing engine.
//!
//! One chunk flows through the stages in order:
//!
//! 1. [`selector`]: due entries are row-locked and stamped in progress;
//!    entries out of retries are split off to exceeded handling
//! 2. [`clustering`]: payloads are checked and entries grouped into units
//! 3. [`dispatch`]: units run through their handler, at most `parallelism`
//!    at once, each checked by the [`keepalive`] first
//! 4. [`aggregator`]: verdicts are merged worst-wins and persisted
//!
//! All per-chunk state (selected entries, verdicts, in-flight lease checks)
//! is created for the chunk and dropped with it.

pub mod aggregator;
pub(crate) mod clustering;
pub mod dispatch;
pub mod handler;
pub mod keepalive;
pub mod processor;
pub(crate) mod selector;
pub mod transaction;

pub use aggregator::{StatusAggregator, StatusCounts};
pub use dispatch::UnitOutcome;
pub use handler::{EventHandler, HandlerRegistry, UnitContext, parse_payload};
pub use keepalive::{Keepalive, KeepaliveOutcome, SelectedEntries};
pub use processor::{Engine, TickSummary};
pub use transaction::{NoopTransactions, PgTransactions, TransactionProvider};
