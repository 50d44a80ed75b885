//! Observability: tracing/logging initialization for processes embedding the
//! ledger.

pub mod tracing;

pub use tracing::init;
