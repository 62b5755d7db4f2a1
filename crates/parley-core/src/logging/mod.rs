//! Structured logging setup.
//!
//! Everything in the workspace logs through `tracing` with structured fields
//! (`user_id`, `call_id`, `attempt`, `transport`). Binaries install a
//! subscriber once at startup with [`init_subscriber`] (human-readable) or
//! [`init_json_subscriber`] (one JSON object per line). `RUST_LOG`, when
//! set, overrides the configured level.
//!
//! [`capture_logs`] installs a thread-local capture layer for assertions in
//! tests.

pub mod test_utils;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber with compact stderr output.
///
/// Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber with JSON lines on stderr.
pub fn init_json_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .json()
        .flatten_event(true);

    let _ = subscriber.try_init();
}
