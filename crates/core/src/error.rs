//! Domain error model.

use thiserror::Error;

use crate::id::AggregateId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts, stock shortfalls). Infrastructure concerns belong
/// elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input). Client-correctable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated. Always a bug signal, never expected
    /// in normal operation.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. duplicate batch number, resolving an
    /// already-resolved alert, stale version).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A requested quantity exceeds what the selected batch (or FEFO
    /// selection) can supply. Carries the medicine and the quantities so the
    /// caller can build user-facing messaging.
    #[error("insufficient stock for medicine {medicine_id}: requested {requested}, available {available}")]
    InsufficientStock {
        medicine_id: AggregateId,
        requested: u32,
        available: u32,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn insufficient_stock(medicine_id: AggregateId, requested: u32, available: u32) -> Self {
        Self::InsufficientStock {
            medicine_id,
            requested,
            available,
        }
    }

    /// Shortfall of an insufficient-stock error, zero for other variants.
    pub fn shortfall(&self) -> u32 {
        match self {
            Self::InsufficientStock {
                requested,
                available,
                ..
            } => requested.saturating_sub(*available),
            _ => 0,
        }
    }
}
