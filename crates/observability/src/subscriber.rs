//! JSON tracing subscriber.
//!
//! Engine events carry structured fields (`tenant_id`, `event`, `entry_id`,
//! `cluster_key`), so the output is one JSON object per line, filtered by
//! `RUST_LOG` when set.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber with [`DEFAULT_FILTER`].
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Install the global subscriber, falling back to `directive` when
/// `RUST_LOG` is unset or invalid.
pub fn init_with_default(directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
