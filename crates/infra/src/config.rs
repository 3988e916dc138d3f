//! Engine configuration.
//!
//! Loaded once at startup from a `.yaml`/`.yml` or `.json` file, validated,
//! and shared as `Arc<EngineConfig>`. Nothing re-reads or mutates it later.
//!
//! ```yaml
//! run_interval_ms: 300000
//! lock_backend: redis
//! topology:
//!   multi_instance: true
//!   multi_tenant: true
//! events:
//!   - type: Notification
//!     sub_type: Mail
//!     parallelism: 4
//!     retry_limit: 5
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use rowqueue_core::EventKey;

use crate::error::ConfigError;

/// Upper bound for concurrently dispatched units of one event.
pub const MAX_PARALLELISM: usize = 10;

/// Upper bound for entries selected per chunk.
pub const MAX_CHUNK_SIZE: usize = 100;

const DEFAULT_RUN_INTERVAL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_STARTUP_DELAY_MS: u64 = 10 * 1000;
const DEFAULT_ROW_LOCK_WAIT_SECS: u64 = 10;
const DEFAULT_ORPHAN_TIMEOUT_MS: u64 = 30 * 60 * 1000;

fn default_run_interval_ms() -> u64 {
    DEFAULT_RUN_INTERVAL_MS
}

fn default_startup_delay_ms() -> u64 {
    DEFAULT_STARTUP_DELAY_MS
}

fn default_row_lock_wait_secs() -> u64 {
    DEFAULT_ROW_LOCK_WAIT_SECS
}

fn default_orphan_timeout_ms() -> u64 {
    DEFAULT_ORPHAN_TIMEOUT_MS
}

fn default_parallelism() -> usize {
    1
}

fn default_retry_limit() -> u32 {
    3
}

fn default_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

/// Which distributed lock implementation the deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// Atomic set-if-absent in Redis.
    Redis,
    /// Rows in the `event_lock` table.
    #[default]
    Database,
}

/// Deployment shape: instances × tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub multi_instance: bool,
    #[serde(default)]
    pub multi_tenant: bool,
}

/// Per `(type, sub_type)` processing options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(alias = "subType")]
    pub sub_type: String,
    /// Units dispatched concurrently (1..=10).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Dispatches allowed before an entry is marked exceeded.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Entries selected per chunk (1..=100).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Persist statuses right after each unit instead of once per tick.
    #[serde(default)]
    pub commit_per_unit: bool,
    /// Verify entries were not touched externally before dispatching them.
    #[serde(default = "default_true")]
    pub stale_check: bool,
    /// Keep selecting while chunks come back full, within the tick interval.
    #[serde(default)]
    pub check_next_chunk: bool,
    /// When false, one instance at a time processes this event per tenant.
    #[serde(default = "default_true")]
    pub concurrent_processing: bool,
}

impl EventConfig {
    pub fn new(event_type: impl Into<String>, sub_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            sub_type: sub_type.into(),
            parallelism: default_parallelism(),
            retry_limit: default_retry_limit(),
            chunk_size: default_chunk_size(),
            commit_per_unit: false,
            stale_check: true,
            check_next_chunk: false,
            concurrent_processing: true,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(self.event_type.clone(), self.sub_type.clone())
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_commit_per_unit(mut self, commit_per_unit: bool) -> Self {
        self.commit_per_unit = commit_per_unit;
        self
    }

    pub fn with_stale_check(mut self, stale_check: bool) -> Self {
        self.stale_check = stale_check;
        self
    }

    pub fn with_check_next_chunk(mut self, check_next_chunk: bool) -> Self {
        self.check_next_chunk = check_next_chunk;
        self
    }

    pub fn with_concurrent_processing(mut self, concurrent_processing: bool) -> Self {
        self.concurrent_processing = concurrent_processing;
        self
    }

    /// Units share one business transaction only in plain serial mode.
    pub fn shares_transaction(&self) -> bool {
        self.parallelism == 1 && !self.commit_per_unit
    }

    fn normalize(&mut self) -> Result<(), ConfigError> {
        let key = self.key();
        if self.event_type.is_empty() || self.sub_type.is_empty() {
            return Err(ConfigError::Invalid(
                "event type and sub_type must not be empty".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid(format!("{key}: parallelism must be at least 1")));
        }
        if self.parallelism > MAX_PARALLELISM {
            warn!(
                event = %key,
                configured = self.parallelism,
                limit = MAX_PARALLELISM,
                "parallelism above limit, clamping"
            );
            self.parallelism = MAX_PARALLELISM;
        }
        if self.retry_limit == 0 {
            return Err(ConfigError::Invalid(format!("{key}: retry_limit must be at least 1")));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid(format!("{key}: chunk_size must be at least 1")));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            warn!(
                event = %key,
                configured = self.chunk_size,
                limit = MAX_CHUNK_SIZE,
                "chunk_size above limit, clamping"
            );
            self.chunk_size = MAX_CHUNK_SIZE;
        }
        Ok(())
    }
}

/// Deployment-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between the end of one tick and the start of the next.
    #[serde(default = "default_run_interval_ms")]
    pub run_interval_ms: u64,
    /// Delay before the first tick.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Bounded wait for row locks in bookkeeping transactions.
    #[serde(default = "default_row_lock_wait_secs")]
    pub row_lock_wait_secs: u64,
    /// Age after which an in-progress entry counts as orphaned.
    #[serde(default = "default_orphan_timeout_ms")]
    pub orphan_timeout_ms: u64,
    #[serde(default)]
    pub lock_backend: LockBackend,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_interval_ms: DEFAULT_RUN_INTERVAL_MS,
            startup_delay_ms: DEFAULT_STARTUP_DELAY_MS,
            row_lock_wait_secs: DEFAULT_ROW_LOCK_WAIT_SECS,
            orphan_timeout_ms: DEFAULT_ORPHAN_TIMEOUT_MS,
            lock_backend: LockBackend::default(),
            topology: TopologyConfig::default(),
            events: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a config file; the extension picks the format.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let parse: fn(&str) -> Result<Self, ConfigError> = match extension.as_deref() {
            Some("yaml" | "yml") => Self::from_yaml_str,
            Some("json") => Self::from_json_str,
            _ => return Err(ConfigError::UnsupportedExtension(path.to_path_buf())),
        };

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Arc::new(parse(&raw)?))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validated()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validated()
    }

    /// Build from code, applying the same validation as file loading.
    pub fn with_events(mut self, events: Vec<EventConfig>) -> Result<Self, ConfigError> {
        self.events = events;
        self.validated()
    }

    /// Clamp out-of-range values and reject duplicates.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.run_interval_ms == 0 {
            return Err(ConfigError::Invalid("run_interval_ms must be positive".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for event in &mut self.events {
            event.normalize()?;
            if !seen.insert(event.key()) {
                return Err(ConfigError::DuplicateEvent(event.key()));
            }
        }
        Ok(self)
    }

    pub fn with_run_interval(mut self, interval: Duration) -> Self {
        self.run_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_orphan_timeout(mut self, timeout: Duration) -> Self {
        self.orphan_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_topology(mut self, multi_instance: bool, multi_tenant: bool) -> Self {
        self.topology = TopologyConfig {
            multi_instance,
            multi_tenant,
        };
        self
    }

    pub fn event(&self, key: &EventKey) -> Option<&EventConfig> {
        self.events
            .iter()
            .find(|e| e.event_type == key.event_type && e.sub_type == key.sub_type)
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_millis(self.run_interval_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn row_lock_wait(&self) -> Duration {
        Duration::from_secs(self.row_lock_wait_secs)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_millis(self.orphan_timeout_ms)
    }
}
