//! Error types of the infrastructure layer.
//!
//! Each concern owns its enum; the engine decides per call site which ones
//! are silent (retried next tick) and which are logged.

use std::path::PathBuf;
use std::time::Duration;

use rowqueue_core::{DomainError, EntryId, EventKey};

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Row locks were not granted within the bounded wait.
    #[error("row lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("entry not found: {0}")]
    NotFound(EntryId),
    #[error("conflict: {0}")]
    Conflict(String),
    /// A producer tried to enqueue an entry nobody processes.
    #[error("no event configured for {0}")]
    UnknownEvent(EventKey),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Distributed lock backend error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("cache error: {0}")]
    Cache(String),
    #[error("database error: {0}")]
    Database(String),
}

/// Configuration error. Any of these aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported config file extension: {0} (allowed: .yaml, .yml, .json)")]
    UnsupportedExtension(PathBuf),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("event {0} is configured more than once")]
    DuplicateEvent(EventKey),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Error raised by handler code or by the transactions wrapped around it.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload for entry {id}: {reason}")]
    InvalidPayload { id: EntryId, reason: String },
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Handler registration error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for {0}")]
    DuplicateHandler(EventKey),
    #[error("no event configured for {0}")]
    UnknownEvent(EventKey),
}
