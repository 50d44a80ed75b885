//! Projections: disposable read models maintained from the event streams.
//!
//! Each projection tracks a per-stream cursor so applying an envelope twice
//! is a no-op and a gap in sequence numbers is detected instead of silently
//! producing a wrong read model. Rebuilding from scratch replays the whole
//! store.

pub mod batch_directory;
pub mod stock_levels;
pub mod transaction_log;

pub use batch_directory::{BatchDirectory, BatchQuery, BatchRow};
pub use stock_levels::{StockLevelRow, StockLevelsProjection};
pub use transaction_log::{
    StockTransaction, TransactionDirection, TransactionKind, TransactionLog, TransactionQuery,
};

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use rxledger_core::AggregateId;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("envelope does not match its stream: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Outcome of a cursor check for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorDecision {
    /// Already applied (at-least-once delivery): skip silently.
    AlreadyApplied,
    /// Fresh envelope: apply, then commit the cursor.
    Apply,
}

/// Per-stream cursor table shared by all projections.
#[derive(Debug, Default)]
pub(crate) struct Cursors {
    inner: RwLock<HashMap<AggregateId, u64>>,
}

impl Cursors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn check(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<CursorDecision, ProjectionError> {
        let last = match self.inner.read() {
            Ok(map) => *map.get(&aggregate_id).unwrap_or(&0),
            Err(_) => 0,
        };

        if sequence_number == 0 {
            return Err(ProjectionError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }
        if sequence_number <= last {
            return Ok(CursorDecision::AlreadyApplied);
        }
        if last != 0 && sequence_number != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }

        Ok(CursorDecision::Apply)
    }

    pub(crate) fn commit(&self, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(aggregate_id, sequence_number);
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut map) = self.inner.write() {
            map.clear();
        }
    }
}
