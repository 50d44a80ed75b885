//! Transaction-log projection: the materialized audit trail.
//!
//! Every stock-affecting event becomes one immutable transaction row carrying
//! the positive quantity, its direction, and the balance before/after.
//! `replay` recomputes a medicine's stock from zero, the consistency check
//! that backs the conservation property.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use rxledger_catalog::MedicineId;
use rxledger_core::ActorId;
use rxledger_events::EventEnvelope;
use rxledger_inventory::{BatchId, Reference, StockEvent, WriteOffReason};

use crate::projections::{CursorDecision, Cursors, ProjectionError};
use crate::read_model::ReadModelStore;
use crate::streams;

/// Ledger-entry classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Sale,
    Adjustment,
    Expired,
    Damaged,
    Transfer,
}

/// Stock movement direction. Transfers move location, not quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDirection {
    Inbound,
    Outbound,
    Neutral,
}

/// One materialized ledger row. Append-only: rows are inserted once and
/// never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransaction {
    pub id: Uuid,
    pub medicine_id: MedicineId,
    pub batch_id: Option<BatchId>,
    pub kind: TransactionKind,
    /// Positive magnitude; the direction carries the sign.
    pub quantity: u32,
    pub direction: TransactionDirection,
    pub balance_before: u32,
    pub balance_after: u32,
    pub reference: Option<Reference>,
    pub performed_by: ActorId,
    pub occurred_at: DateTime<Utc>,
    pub sequence_number: u64,
}

impl StockTransaction {
    pub fn signed_delta(&self) -> i64 {
        match self.direction {
            TransactionDirection::Inbound => i64::from(self.quantity),
            TransactionDirection::Outbound => -i64::from(self.quantity),
            TransactionDirection::Neutral => 0,
        }
    }
}

/// Typed query specification over the transaction log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
    pub medicine_id: Option<MedicineId>,
    pub batch_id: Option<BatchId>,
    pub kind: Option<TransactionKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TransactionQuery {
    fn matches(&self, row: &StockTransaction) -> bool {
        if self.medicine_id.is_some_and(|m| m != row.medicine_id) {
            return false;
        }
        if self.batch_id.is_some() && self.batch_id != row.batch_id {
            return false;
        }
        if self.kind.is_some_and(|k| k != row.kind) {
            return false;
        }
        if self.from.is_some_and(|from| row.occurred_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| row.occurred_at > to) {
            return false;
        }
        true
    }
}

/// Maintains [`StockTransaction`] rows from stock events.
#[derive(Debug)]
pub struct TransactionLog<S>
where
    S: ReadModelStore<Uuid, StockTransaction>,
{
    store: S,
    cursors: Cursors,
}

impl<S> TransactionLog<S>
where
    S: ReadModelStore<Uuid, StockTransaction>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: Cursors::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<StockTransaction> {
        self.store.get(id)
    }

    /// Query with the typed filter, ordered by (medicine, sequence).
    pub fn query(&self, query: &TransactionQuery) -> Vec<StockTransaction> {
        let mut rows: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();
        rows.sort_by_key(|r| (r.medicine_id, r.sequence_number));

        rows.into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Recompute a medicine's stock by summing signed quantities from zero.
    ///
    /// Must equal the stored summary at all times; used by the offline
    /// consistency check.
    pub fn replay(&self, medicine_id: MedicineId) -> i64 {
        self.query(&TransactionQuery {
            medicine_id: Some(medicine_id),
            ..TransactionQuery::default()
        })
        .iter()
        .map(StockTransaction::signed_delta)
        .sum()
    }

    /// Apply one committed envelope.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != streams::STOCK {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        match self.cursors.check(aggregate_id, seq)? {
            CursorDecision::AlreadyApplied => return Ok(()),
            CursorDecision::Apply => {}
        }

        let ev: StockEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        if let Some(row) = Self::row_for(envelope.event_id(), seq, &ev) {
            self.store.upsert(row.id, row);
        }

        self.cursors.commit(aggregate_id, seq);
        Ok(())
    }

    fn row_for(event_id: Uuid, sequence_number: u64, ev: &StockEvent) -> Option<StockTransaction> {
        let row = match ev {
            StockEvent::BatchReceived(e) => StockTransaction {
                id: event_id,
                medicine_id: e.medicine_id,
                batch_id: Some(e.batch_id),
                kind: TransactionKind::Purchase,
                quantity: e.quantity,
                direction: TransactionDirection::Inbound,
                balance_before: e.balance_before,
                balance_after: e.balance_after,
                reference: e.reference.clone(),
                performed_by: e.performed_by,
                occurred_at: e.occurred_at,
                sequence_number,
            },
            StockEvent::StockConsumed(e) => StockTransaction {
                id: event_id,
                medicine_id: e.medicine_id,
                batch_id: Some(e.batch_id),
                kind: TransactionKind::Sale,
                quantity: e.quantity,
                direction: TransactionDirection::Outbound,
                balance_before: e.balance_before,
                balance_after: e.balance_after,
                reference: e.reference.clone(),
                performed_by: e.performed_by,
                occurred_at: e.occurred_at,
                sequence_number,
            },
            StockEvent::StockWrittenOff(e) => StockTransaction {
                id: event_id,
                medicine_id: e.medicine_id,
                batch_id: Some(e.batch_id),
                kind: match e.reason {
                    WriteOffReason::Expired => TransactionKind::Expired,
                    WriteOffReason::Damaged => TransactionKind::Damaged,
                },
                quantity: e.quantity,
                direction: TransactionDirection::Outbound,
                balance_before: e.balance_before,
                balance_after: e.balance_after,
                reference: None,
                performed_by: e.performed_by,
                occurred_at: e.occurred_at,
                sequence_number,
            },
            StockEvent::StockAdjusted(e) => StockTransaction {
                id: event_id,
                medicine_id: e.medicine_id,
                batch_id: Some(e.batch_id),
                kind: TransactionKind::Adjustment,
                quantity: e.quantity,
                direction: if e.is_increase {
                    TransactionDirection::Inbound
                } else {
                    TransactionDirection::Outbound
                },
                balance_before: e.balance_before,
                balance_after: e.balance_after,
                reference: None,
                performed_by: e.performed_by,
                occurred_at: e.occurred_at,
                sequence_number,
            },
            StockEvent::BatchTransferred(e) => StockTransaction {
                id: event_id,
                medicine_id: e.medicine_id,
                batch_id: Some(e.batch_id),
                kind: TransactionKind::Transfer,
                quantity: e.quantity,
                direction: TransactionDirection::Neutral,
                balance_before: e.balance,
                balance_after: e.balance,
                reference: None,
                performed_by: e.performed_by,
                occurred_at: e.occurred_at,
                sequence_number,
            },
            StockEvent::BatchRecalled(e) => StockTransaction {
                id: event_id,
                medicine_id: e.medicine_id,
                batch_id: Some(e.batch_id),
                kind: TransactionKind::Adjustment,
                quantity: e.quantity_removed,
                direction: TransactionDirection::Outbound,
                balance_before: e.balance_before,
                balance_after: e.balance_after,
                reference: e.reference.clone(),
                performed_by: e.performed_by,
                occurred_at: e.occurred_at,
                sequence_number,
            },
            StockEvent::StockOpened(_) | StockEvent::ReorderLevelsSet(_) => return None,
        };
        Some(row)
    }

    /// Clear and replay (offline consistency safety net).
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        self.store.clear();
        self.cursors.clear();

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (e.aggregate_id(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
