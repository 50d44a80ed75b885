//! Stock-levels projection: the per-medicine inventory summary row.
//!
//! This is the redundant `current_stock` record kept for cheap threshold
//! checks. The ledger (event stream) is the source of truth; this row is
//! updated in the same unit of work as every append and can be rebuilt from
//! scratch at any time.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use rxledger_catalog::MedicineId;
use rxledger_events::EventEnvelope;
use rxledger_inventory::StockEvent;

use crate::projections::{CursorDecision, Cursors, ProjectionError};
use crate::read_model::ReadModelStore;
use crate::streams;

/// Read model: one row per medicine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevelRow {
    pub medicine_id: MedicineId,
    pub current_stock: u32,
    pub min_stock_level: u32,
    pub max_stock_level: u32,
    pub reorder_level: u32,
    pub last_stock_update: Option<DateTime<Utc>>,
}

impl StockLevelRow {
    pub fn is_stock_out(&self) -> bool {
        self.current_stock == 0
    }

    pub fn is_low_stock(&self) -> bool {
        self.current_stock > 0 && self.current_stock <= self.reorder_level
    }
}

/// Maintains [`StockLevelRow`]s from stock events.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: ReadModelStore<MedicineId, StockLevelRow>,
{
    store: S,
    cursors: Cursors,
}

impl<S> StockLevelsProjection<S>
where
    S: ReadModelStore<MedicineId, StockLevelRow>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: Cursors::new(),
        }
    }

    pub fn get(&self, medicine_id: &MedicineId) -> Option<StockLevelRow> {
        self.store.get(medicine_id)
    }

    pub fn list(&self) -> Vec<StockLevelRow> {
        let mut rows = self.store.list();
        rows.sort_by_key(|r| r.medicine_id);
        rows
    }

    pub fn list_low_stock(&self) -> Vec<StockLevelRow> {
        self.list()
            .into_iter()
            .filter(|r| r.is_low_stock() || r.is_stock_out())
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

        let medicine_id = MedicineId::new(aggregate_id);
        match ev {
            StockEvent::StockOpened(e) => {
                self.store.upsert(
                    medicine_id,
                    StockLevelRow {
                        medicine_id,
                        current_stock: 0,
                        min_stock_level: e.levels.min_stock_level,
                        max_stock_level: e.levels.max_stock_level,
                        reorder_level: e.levels.reorder_level,
                        last_stock_update: None,
                    },
                );
            }
            StockEvent::ReorderLevelsSet(e) => {
                if let Some(mut row) = self.store.get(&medicine_id) {
                    row.min_stock_level = e.levels.min_stock_level;
                    row.max_stock_level = e.levels.max_stock_level;
                    row.reorder_level = e.levels.reorder_level;
                    self.store.upsert(medicine_id, row);
                }
            }
            StockEvent::BatchReceived(e) => {
                self.update_balance(medicine_id, e.balance_after, e.occurred_at);
            }
            StockEvent::StockConsumed(e) => {
                self.update_balance(medicine_id, e.balance_after, e.occurred_at);
            }
            StockEvent::StockWrittenOff(e) => {
                self.update_balance(medicine_id, e.balance_after, e.occurred_at);
            }
            StockEvent::StockAdjusted(e) => {
                self.update_balance(medicine_id, e.balance_after, e.occurred_at);
            }
            StockEvent::BatchRecalled(e) => {
                self.update_balance(medicine_id, e.balance_after, e.occurred_at);
            }
            StockEvent::BatchTransferred(_) => {}
        }

        self.cursors.commit(aggregate_id, seq);
        Ok(())
    }

    fn update_balance(&self, medicine_id: MedicineId, balance: u32, at: DateTime<Utc>) {
        if let Some(mut row) = self.store.get(&medicine_id) {
            row.current_stock = balance;
            row.last_stock_update = Some(at);
            self.store.upsert(medicine_id, row);
        }
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
