//! Batch-directory projection: one row per lot, queryable by medicine,
//! status and expiry window.

use chrono::{Days, NaiveDate};
use serde_json::Value as JsonValue;

use rxledger_catalog::MedicineId;
use rxledger_core::Money;
use rxledger_events::EventEnvelope;
use rxledger_inventory::{BatchId, BatchNumber, BatchStatus, StockEvent};

use crate::projections::{CursorDecision, Cursors, ProjectionError};
use crate::read_model::ReadModelStore;
use crate::streams;

/// Read model: one row per batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    pub batch_id: BatchId,
    pub medicine_id: MedicineId,
    pub batch_number: BatchNumber,
    pub quantity: u32,
    pub unit_cost: Money,
    pub selling_price: Money,
    pub manufacturing_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub received_date: NaiveDate,
    pub status: BatchStatus,
    pub location: String,
}

/// Typed query specification over batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchQuery {
    pub medicine_id: Option<MedicineId>,
    pub status: Option<BatchStatus>,
    pub expires_before: Option<NaiveDate>,
    pub expires_after: Option<NaiveDate>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl BatchQuery {
    fn matches(&self, row: &BatchRow) -> bool {
        if self.medicine_id.is_some_and(|m| m != row.medicine_id) {
            return false;
        }
        if self.status.is_some_and(|s| s != row.status) {
            return false;
        }
        if self
            .expires_before
            .is_some_and(|before| row.expiry_date >= before)
        {
            return false;
        }
        if self
            .expires_after
            .is_some_and(|after| row.expiry_date <= after)
        {
            return false;
        }
        true
    }
}

/// Maintains [`BatchRow`]s from stock events.
#[derive(Debug)]
pub struct BatchDirectory<S>
where
    S: ReadModelStore<BatchId, BatchRow>,
{
    store: S,
    cursors: Cursors,
}

impl<S> BatchDirectory<S>
where
    S: ReadModelStore<BatchId, BatchRow>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: Cursors::new(),
        }
    }

    pub fn get(&self, batch_id: &BatchId) -> Option<BatchRow> {
        self.store.get(batch_id)
    }

    /// Query with the typed filter, ordered by (medicine, expiry, batch).
    pub fn query(&self, query: &BatchQuery) -> Vec<BatchRow> {
        let mut rows: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();
        rows.sort_by_key(|r| (r.medicine_id, r.expiry_date, r.batch_id));

        rows.into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Available batches with stock on hand whose expiry falls within
    /// `horizon_days` of `today` (expiry-warning horizon query).
    pub fn expiring(&self, today: NaiveDate, horizon_days: u32) -> Vec<BatchRow> {
        let horizon = today + Days::new(u64::from(horizon_days));
        let mut rows: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|row| {
                row.status == BatchStatus::Available
                    && row.quantity > 0
                    && row.expiry_date <= horizon
            })
            .collect();
        rows.sort_by_key(|r| (r.expiry_date, r.medicine_id, r.batch_id));
        rows
    }

    /// Available batches already past expiry as of `today` (the mark-expired
    /// sweep input).
    pub fn expired_available(&self, today: NaiveDate) -> Vec<BatchRow> {
        self.store
            .list()
            .into_iter()
            .filter(|row| row.status == BatchStatus::Available && row.expiry_date <= today)
            .collect()
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

        match ev {
            StockEvent::BatchReceived(e) => {
                self.store.upsert(
                    e.batch_id,
                    BatchRow {
                        batch_id: e.batch_id,
                        medicine_id: e.medicine_id,
                        batch_number: e.batch_number,
                        quantity: e.quantity,
                        unit_cost: e.unit_cost,
                        selling_price: e.selling_price,
                        manufacturing_date: e.manufacturing_date,
                        expiry_date: e.expiry_date,
                        received_date: e.received_date,
                        status: BatchStatus::Available,
                        location: e.location,
                    },
                );
            }
            StockEvent::StockConsumed(e) => {
                if let Some(mut row) = self.store.get(&e.batch_id) {
                    row.quantity = e.batch_remaining;
                    if row.quantity == 0 {
                        row.status = BatchStatus::OutOfStock;
                    }
                    self.store.upsert(e.batch_id, row);
                }
            }
            StockEvent::StockWrittenOff(e) => {
                if let Some(mut row) = self.store.get(&e.batch_id) {
                    row.quantity = e.batch_remaining;
                    if row.quantity == 0 {
                        row.status = e.reason.terminal_status();
                    }
                    self.store.upsert(e.batch_id, row);
                }
            }
            StockEvent::StockAdjusted(e) => {
                if let Some(mut row) = self.store.get(&e.batch_id) {
                    row.quantity = e.batch_remaining;
                    if row.quantity == 0 {
                        row.status = BatchStatus::OutOfStock;
                    } else if row.status == BatchStatus::OutOfStock {
                        row.status = BatchStatus::Available;
                    }
                    self.store.upsert(e.batch_id, row);
                }
            }
            StockEvent::BatchTransferred(e) => {
                if let Some(mut row) = self.store.get(&e.batch_id) {
                    row.location = e.to_location;
                    self.store.upsert(e.batch_id, row);
                }
            }
            StockEvent::BatchRecalled(e) => {
                if let Some(mut row) = self.store.get(&e.batch_id) {
                    row.status = BatchStatus::Recalled;
                    self.store.upsert(e.batch_id, row);
                }
            }
            StockEvent::StockOpened(_) | StockEvent::ReorderLevelsSet(_) => {}
        }

        self.cursors.commit(aggregate_id, seq);
        Ok(())
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
