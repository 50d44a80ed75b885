//! Batch ledger + inventory aggregate: dated lots, FEFO dispensing, running
//! per-medicine stock with reorder thresholds, and the append-only stock
//! events that form the transaction ledger.

pub mod batch;
pub mod levels;
pub mod stock;

pub use batch::{Batch, BatchId, BatchNumber, BatchStatus, WriteOffReason, select_fefo};
pub use levels::ReorderLevels;
pub use stock::{
    AdjustStock, BatchReceived, BatchRecalled, BatchTransferred, ConsumeStock, MarkBatchExpired,
    MedicineStock, OpenStock, ReceiveBatch, RecallBatch, Reference, ReorderLevelsSet,
    SetReorderLevels, StockAdjusted, StockCommand, StockConsumed, StockEvent, StockOpened,
    StockWrittenOff, TransferBatch, WriteOffStock,
};
