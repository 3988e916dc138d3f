//! Process-wide tracing setup shared by the queue engine's binaries and
//! tests.

pub mod subscriber;

pub use subscriber::{DEFAULT_FILTER, init, init_with_default};
