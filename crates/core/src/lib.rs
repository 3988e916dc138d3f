//! `rowqueue-core`: domain building blocks of the row-backed event queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, entry statuses with the worst-status-wins merge, and the
//! value types that flow through one processing tick.

pub mod entry;
pub mod error;
pub mod id;
pub mod status;

pub use entry::{ClusterKey, EventKey, NewEntry, ProcessingUnit, QueueEntry, Verdict, now_micros};
pub use error::{DomainError, DomainResult};
pub use id::{EntryId, TenantId};
pub use status::{EntryStatus, StatusMap};
