//! Tracing/logging initialization.
//!
//! The ledger logs commits at `info`, fan-out publication failures at `warn`
//! (the one swallowed error class), and invariant violations at `error`.

use tracing_subscriber::EnvFilter;

/// Initialize JSON logging for the process, filtered via `RUST_LOG` with
/// `info` as the fallback.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default("info");
}

/// Like [`init`], with an explicit fallback directive for when `RUST_LOG`
/// is unset (e.g. `"rxledger_infra=debug"` while chasing a conflict storm).
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Human-readable output for local test runs; never JSON.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .compact()
        .with_target(false)
        .try_init();
}
