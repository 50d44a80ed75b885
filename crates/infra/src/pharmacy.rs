//! Pharmacy orchestration facade.
//!
//! `PharmacyService` ties the subsystem together: commands run through the
//! dispatcher (optimistic concurrency + retry), committed events update the
//! projections inside the same unit of work, alert thresholds re-evaluate
//! against the post-commit aggregate state, and notifications fan out to
//! observers strictly after commit, fire-and-forget.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use chrono::Datelike;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use rxledger_alerts::{Alert, AlertId, AlertPolicy, desired_conditions, diff_conditions};
use rxledger_billing::{
    ApplyPayment, BillNumber, CreateSale, LineItem, PatientId, Payment, PaymentId, PaymentMethod,
    PrescriptionId, Sale, SaleCommand, SaleId, SaleTotals,
};
use rxledger_catalog::{
    Medicine, MedicineCommand, MedicineId, RegisterMedicine, RetireMedicine,
};
use rxledger_core::{ActorId, Aggregate, AggregateId, ExpectedVersion, Money, Percent};
use rxledger_events::{
    EventClass, FanOutBus, Notification, Subscription, SubscriberId,
};
use rxledger_inventory::{
    AdjustStock, Batch, BatchId, BatchNumber, ConsumeStock, MarkBatchExpired, MedicineStock,
    OpenStock, ReceiveBatch, RecallBatch, Reference, ReorderLevels, SetReorderLevels, StockCommand,
    StockEvent, TransferBatch, WriteOffReason, WriteOffStock,
};

use crate::alert_registry::AlertRegistry;
use crate::bill_numbers::BillNumberSequence;
use crate::command_dispatcher::{CommandDispatcher, DispatchError, RetryPolicy};
use crate::event_store::{EventStore, StoredEvent, StreamAppend, UncommittedEvent};
use crate::projections::{
    BatchDirectory, BatchQuery, BatchRow, StockLevelRow, StockLevelsProjection, StockTransaction,
    TransactionLog, TransactionQuery,
};
use crate::read_model::InMemoryReadModelStore;
use crate::streams;

/// Service-wide policy knobs, passed explicitly rather than read from
/// ambient state.
#[derive(Debug, Clone, Copy)]
pub struct PharmacyConfig {
    pub alert_policy: AlertPolicy,
    pub retry: RetryPolicy,
    pub fanout_capacity: usize,
    /// Thresholds applied when an inventory record is created lazily on
    /// first receipt.
    pub default_levels: ReorderLevels,
}

impl Default for PharmacyConfig {
    fn default() -> Self {
        Self {
            alert_policy: AlertPolicy::default(),
            retry: RetryPolicy::default(),
            fanout_capacity: rxledger_events::fanout::DEFAULT_SUBSCRIBER_CAPACITY,
            default_levels: ReorderLevels {
                min_stock_level: 0,
                max_stock_level: u32::MAX,
                reorder_level: 0,
            },
        }
    }
}

/// Request to register a catalog medicine.
#[derive(Debug, Clone)]
pub struct RegisterMedicineRequest {
    pub name: String,
    pub generic_name: String,
    pub brand_name: Option<String>,
    pub manufacturer: String,
    pub dosage_form: String,
    pub strength: String,
    pub prescription_required: bool,
}

/// Request to receive a batch of stock.
#[derive(Debug, Clone)]
pub struct ReceiveBatchRequest {
    pub medicine_id: MedicineId,
    pub batch_number: String,
    pub quantity: u32,
    pub unit_cost: Money,
    pub selling_price: Money,
    pub manufacturing_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub received_date: NaiveDate,
    pub location: String,
    pub reference: Option<Reference>,
}

/// One requested bill line. `batch_id: None` selects the lot via FEFO.
#[derive(Debug, Clone)]
pub struct SaleItemRequest {
    pub medicine_id: MedicineId,
    pub batch_id: Option<BatchId>,
    pub quantity: u32,
    pub unit_price: Money,
    pub discount_pct: Percent,
    pub tax_pct: Percent,
}

/// Request to create a point-of-sale bill.
#[derive(Debug, Clone)]
pub struct CreateSaleRequest {
    pub patient_id: PatientId,
    pub prescription_id: Option<PrescriptionId>,
    pub items: Vec<SaleItemRequest>,
    pub notes: Option<String>,
}

/// Working state for one medicine inside a sale's unit of work.
struct StockWork {
    stock: MedicineStock,
    loaded_version: u64,
    pending: Vec<UncommittedEvent>,
}

/// The pharmacy subsystem facade.
pub struct PharmacyService<S: EventStore> {
    store: Arc<S>,
    dispatcher: CommandDispatcher<Arc<S>>,
    levels: StockLevelsProjection<InMemoryReadModelStore<MedicineId, StockLevelRow>>,
    transactions: TransactionLog<InMemoryReadModelStore<Uuid, StockTransaction>>,
    batches: BatchDirectory<InMemoryReadModelStore<BatchId, BatchRow>>,
    alerts: AlertRegistry,
    bus: FanOutBus<Notification>,
    bill_numbers: BillNumberSequence,
    config: PharmacyConfig,
}

impl<S: EventStore> PharmacyService<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, PharmacyConfig::default())
    }

    pub fn with_config(store: S, config: PharmacyConfig) -> Self {
        let store = Arc::new(store);
        Self {
            dispatcher: CommandDispatcher::with_retry(Arc::clone(&store), config.retry),
            store,
            levels: StockLevelsProjection::new(InMemoryReadModelStore::new()),
            transactions: TransactionLog::new(InMemoryReadModelStore::new()),
            batches: BatchDirectory::new(InMemoryReadModelStore::new()),
            alerts: AlertRegistry::new(),
            bus: FanOutBus::with_capacity(config.fanout_capacity),
            bill_numbers: BillNumberSequence::new(),
            config,
        }
    }

    // ---- catalog ---------------------------------------------------------

    pub fn register_medicine(
        &self,
        request: RegisterMedicineRequest,
    ) -> Result<MedicineId, DispatchError> {
        let medicine_id = MedicineId::new(AggregateId::new());
        let command = MedicineCommand::RegisterMedicine(RegisterMedicine {
            medicine_id,
            name: request.name,
            generic_name: request.generic_name,
            brand_name: request.brand_name,
            manufacturer: request.manufacturer,
            dosage_form: request.dosage_form,
            strength: request.strength,
            prescription_required: request.prescription_required,
            occurred_at: Utc::now(),
        });

        self.dispatcher.dispatch(
            medicine_id.0,
            streams::MEDICINE,
            &command,
            |id| Medicine::empty(MedicineId::new(id)),
        )?;

        tracing::info!(%medicine_id, "medicine registered");
        Ok(medicine_id)
    }

    pub fn retire_medicine(&self, medicine_id: MedicineId) -> Result<(), DispatchError> {
        let command = MedicineCommand::RetireMedicine(RetireMedicine {
            medicine_id,
            occurred_at: Utc::now(),
        });
        self.dispatcher.dispatch(
            medicine_id.0,
            streams::MEDICINE,
            &command,
            |id| Medicine::empty(MedicineId::new(id)),
        )?;
        Ok(())
    }

    pub fn medicine(&self, medicine_id: MedicineId) -> Result<Option<Medicine>, DispatchError> {
        let (medicine, version) = self
            .dispatcher
            .load_aggregate(medicine_id.0, |id| Medicine::empty(MedicineId::new(id)))?;
        Ok((version > 0).then_some(medicine))
    }

    // ---- inventory -------------------------------------------------------

    /// Idempotent creation of the per-medicine inventory record.
    pub fn ensure_stock(
        &self,
        medicine_id: MedicineId,
        levels: ReorderLevels,
    ) -> Result<(), DispatchError> {
        let command = StockCommand::OpenStock(OpenStock {
            medicine_id,
            levels,
            occurred_at: Utc::now(),
        });
        let (stock, committed) = self.dispatch_stock(medicine_id, &command)?;
        if !committed.is_empty() {
            self.finish_stock_commit(&stock, &committed);
        }
        Ok(())
    }

    pub fn set_reorder_levels(
        &self,
        medicine_id: MedicineId,
        levels: ReorderLevels,
        performed_by: ActorId,
    ) -> Result<(), DispatchError> {
        let command = StockCommand::SetReorderLevels(SetReorderLevels {
            medicine_id,
            levels,
            performed_by,
            occurred_at: Utc::now(),
        });
        let (stock, committed) = self.dispatch_stock(medicine_id, &command)?;
        self.finish_stock_commit(&stock, &committed);
        Ok(())
    }

    /// Receive a batch: validates the medicine, lazily creates the inventory
    /// record, appends the Purchase ledger entry, and re-evaluates alerts.
    pub fn receive_batch(
        &self,
        request: ReceiveBatchRequest,
        performed_by: ActorId,
    ) -> Result<Batch, DispatchError> {
        let medicine = self
            .medicine(request.medicine_id)?
            .ok_or(DispatchError::NotFound)?;
        if !medicine.is_stockable() {
            return Err(DispatchError::Conflict(format!(
                "medicine {} is retired",
                request.medicine_id
            )));
        }

        self.ensure_stock(request.medicine_id, self.config.default_levels)?;

        let batch_id = BatchId::new(AggregateId::new());
        let batch_number = BatchNumber::new(request.batch_number).map_err(DispatchError::from)?;
        let command = StockCommand::ReceiveBatch(ReceiveBatch {
            medicine_id: request.medicine_id,
            batch_id,
            batch_number,
            quantity: request.quantity,
            unit_cost: request.unit_cost,
            selling_price: request.selling_price,
            manufacturing_date: request.manufacturing_date,
            expiry_date: request.expiry_date,
            received_date: request.received_date,
            location: request.location,
            reference: request.reference,
            performed_by,
            occurred_at: Utc::now(),
        });

        let (stock, committed) = self.dispatch_stock(request.medicine_id, &command)?;
        self.finish_stock_commit(&stock, &committed);

        tracing::info!(
            medicine_id = %request.medicine_id,
            %batch_id,
            quantity = request.quantity,
            "batch received"
        );

        stock
            .batch(&batch_id)
            .cloned()
            .ok_or_else(|| DispatchError::InvariantViolation("received batch missing".to_string()))
    }

    /// Consume stock outside a sale (FEFO unless a batch is pinned).
    pub fn consume_stock(
        &self,
        medicine_id: MedicineId,
        batch_id: Option<BatchId>,
        quantity: u32,
        reference: Option<Reference>,
        performed_by: ActorId,
    ) -> Result<StockTransaction, DispatchError> {
        let now = Utc::now();
        let command = StockCommand::ConsumeStock(ConsumeStock {
            medicine_id,
            batch_id,
            quantity,
            today: now.date_naive(),
            reference,
            performed_by,
            occurred_at: now,
        });
        let (stock, committed) = self.dispatch_stock(medicine_id, &command)?;
        self.finish_stock_commit(&stock, &committed);
        self.committed_transaction(&committed)
    }

    pub fn write_off(
        &self,
        medicine_id: MedicineId,
        batch_id: BatchId,
        quantity: u32,
        reason: WriteOffReason,
        performed_by: ActorId,
    ) -> Result<StockTransaction, DispatchError> {
        let command = StockCommand::WriteOffStock(WriteOffStock {
            medicine_id,
            batch_id,
            quantity,
            reason,
            performed_by,
            occurred_at: Utc::now(),
        });
        let (stock, committed) = self.dispatch_stock(medicine_id, &command)?;
        self.finish_stock_commit(&stock, &committed);
        self.committed_transaction(&committed)
    }

    pub fn adjust_stock(
        &self,
        medicine_id: MedicineId,
        batch_id: BatchId,
        delta: i32,
        reason: impl Into<String>,
        performed_by: ActorId,
    ) -> Result<StockTransaction, DispatchError> {
        let command = StockCommand::AdjustStock(AdjustStock {
            medicine_id,
            batch_id,
            delta,
            reason: reason.into(),
            performed_by,
            occurred_at: Utc::now(),
        });
        let (stock, committed) = self.dispatch_stock(medicine_id, &command)?;
        self.finish_stock_commit(&stock, &committed);
        self.committed_transaction(&committed)
    }

    pub fn transfer_batch(
        &self,
        medicine_id: MedicineId,
        batch_id: BatchId,
        to_location: impl Into<String>,
        performed_by: ActorId,
    ) -> Result<(), DispatchError> {
        let command = StockCommand::TransferBatch(TransferBatch {
            medicine_id,
            batch_id,
            to_location: to_location.into(),
            performed_by,
            occurred_at: Utc::now(),
        });
        let (stock, committed) = self.dispatch_stock(medicine_id, &command)?;
        self.finish_stock_commit(&stock, &committed);
        Ok(())
    }

    pub fn recall_batch(
        &self,
        medicine_id: MedicineId,
        batch_id: BatchId,
        reference: Option<Reference>,
        performed_by: ActorId,
    ) -> Result<StockTransaction, DispatchError> {
        let command = StockCommand::RecallBatch(RecallBatch {
            medicine_id,
            batch_id,
            reference,
            performed_by,
            occurred_at: Utc::now(),
        });
        let (stock, committed) = self.dispatch_stock(medicine_id, &command)?;
        self.finish_stock_commit(&stock, &committed);
        self.committed_transaction(&committed)
    }

    /// Lifecycle sweep: write off the remaining units of every available
    /// batch whose expiry date has passed. Returns the batches marked.
    pub fn mark_expired_batches(
        &self,
        performed_by: ActorId,
    ) -> Result<Vec<BatchId>, DispatchError> {
        let now = Utc::now();
        let today = now.date_naive();
        let mut marked = Vec::new();

        for row in self.batches.expired_available(today) {
            let command = StockCommand::MarkBatchExpired(MarkBatchExpired {
                medicine_id: row.medicine_id,
                batch_id: row.batch_id,
                today,
                performed_by,
                occurred_at: now,
            });
            match self.dispatch_stock(row.medicine_id, &command) {
                Ok((stock, committed)) => {
                    self.finish_stock_commit(&stock, &committed);
                    marked.push(row.batch_id);
                }
                // Raced with a concurrent consume/write-off: skip this lot,
                // the next sweep will see the refreshed state.
                Err(err) => {
                    tracing::warn!(batch_id = %row.batch_id, ?err, "expiry sweep skipped batch");
                }
            }
        }

        Ok(marked)
    }

    // ---- billing ---------------------------------------------------------

    /// Create a point-of-sale bill.
    ///
    /// The whole multi-medicine consumption plus the sale record commit as
    /// one atomic unit; on a version conflict the unit is re-decided from
    /// fresh state, so no partial stock consumption is ever observable.
    pub fn create_sale(
        &self,
        request: CreateSaleRequest,
        generated_by: ActorId,
    ) -> Result<Sale, DispatchError> {
        if request.items.is_empty() {
            return Err(DispatchError::Validation(
                "cannot bill a sale without items".to_string(),
            ));
        }

        let sale_id = SaleId::new(AggregateId::new());
        let now = Utc::now();
        let bill_number = self.bill_numbers.next(now.year());

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_create_sale(&request, sale_id, &bill_number, generated_by) {
                Err(err) if err.is_concurrency() && attempt < self.config.retry.max_attempts.max(1) => {
                    tracing::debug!(%sale_id, attempt, "sale unit conflicted, re-deciding");
                    continue;
                }
                other => return other,
            }
        }
    }

    fn try_create_sale(
        &self,
        request: &CreateSaleRequest,
        sale_id: SaleId,
        bill_number: &BillNumber,
        generated_by: ActorId,
    ) -> Result<Sale, DispatchError> {
        let now = Utc::now();
        let today = now.date_naive();
        let reference = Reference::new(sale_id.0, "sale");

        let mut stocks: BTreeMap<MedicineId, StockWork> = BTreeMap::new();
        let mut line_items: Vec<LineItem> = Vec::with_capacity(request.items.len());

        for (idx, item) in request.items.iter().enumerate() {
            let work = match stocks.entry(item.medicine_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let (stock, loaded_version) = self
                        .dispatcher
                        .load_aggregate(item.medicine_id.0, |id| {
                            MedicineStock::empty(MedicineId::new(id))
                        })?;
                    entry.insert(StockWork {
                        stock,
                        loaded_version,
                        pending: Vec::new(),
                    })
                }
            };

            let command = StockCommand::ConsumeStock(ConsumeStock {
                medicine_id: item.medicine_id,
                batch_id: item.batch_id,
                quantity: item.quantity,
                today,
                reference: Some(reference.clone()),
                performed_by: generated_by,
                occurred_at: now,
            });

            let events = work.stock.handle(&command).map_err(DispatchError::from)?;
            let Some(StockEvent::StockConsumed(consumed)) = events.first() else {
                return Err(DispatchError::InvariantViolation(
                    "consume decided no stock event".to_string(),
                ));
            };

            line_items.push(LineItem::compute(
                (idx as u32) + 1,
                item.medicine_id,
                consumed.batch_id,
                item.quantity,
                item.unit_price,
                item.discount_pct,
                item.tax_pct,
            )?);

            for event in &events {
                work.pending.push(UncommittedEvent::from_typed(
                    item.medicine_id.0,
                    streams::STOCK,
                    Uuid::now_v7(),
                    event,
                )?);
                work.stock.apply(event);
            }
        }

        let mut totals = SaleTotals::default();
        for line in &line_items {
            totals.accumulate(&line.amounts)?;
        }

        let sale_shell = Sale::empty(sale_id);
        let create = SaleCommand::CreateSale(CreateSale {
            sale_id,
            bill_number: bill_number.clone(),
            patient_id: request.patient_id,
            prescription_id: request.prescription_id,
            items: line_items,
            totals,
            notes: request.notes.clone(),
            generated_by,
            occurred_at: now,
        });
        let sale_events = sale_shell.handle(&create).map_err(DispatchError::from)?;

        let mut appends: Vec<StreamAppend> = Vec::with_capacity(stocks.len() + 1);
        for work in stocks.values() {
            appends.push(StreamAppend {
                expected_version: ExpectedVersion::Exact(work.loaded_version),
                events: work.pending.clone(),
            });
        }
        appends.push(StreamAppend {
            expected_version: ExpectedVersion::Exact(0),
            events: sale_events
                .iter()
                .map(|ev| UncommittedEvent::from_typed(sale_id.0, streams::SALE, Uuid::now_v7(), ev))
                .collect::<Result<Vec<_>, _>>()?,
        });

        let committed = self.store.append_many(appends)?;

        // Same unit of work: projections first, then alert re-evaluation
        // against the post-commit state, then fan-out.
        self.project(&committed);
        for work in stocks.values() {
            self.evaluate_alerts(&work.stock);
        }
        self.notify_stock_events(&committed);

        let mut sale = Sale::empty(sale_id);
        for event in &sale_events {
            sale.apply(event);
        }

        tracing::info!(
            %sale_id,
            bill_number = %bill_number,
            items = sale.items().len(),
            total = %sale.totals().total_amount,
            "sale created"
        );

        Ok(sale)
    }

    /// Append a payment to a sale and recompute its settlement state.
    pub fn apply_payment(
        &self,
        sale_id: SaleId,
        amount: Money,
        method: PaymentMethod,
        reference: Option<String>,
        processed_by: ActorId,
    ) -> Result<Payment, DispatchError> {
        let command = SaleCommand::ApplyPayment(ApplyPayment {
            sale_id,
            payment_id: PaymentId::new(AggregateId::new()),
            amount,
            method,
            reference,
            processed_by,
            occurred_at: Utc::now(),
        });

        let (sale, _committed) = self.dispatcher.dispatch(
            sale_id.0,
            streams::SALE,
            &command,
            |id| Sale::empty(SaleId::new(id)),
        )?;

        sale.payments().last().cloned().ok_or_else(|| {
            DispatchError::InvariantViolation("payment not recorded on sale".to_string())
        })
    }

    pub fn sale(&self, sale_id: SaleId) -> Result<Option<Sale>, DispatchError> {
        let (sale, _) = self
            .dispatcher
            .load_aggregate(sale_id.0, |id| Sale::empty(SaleId::new(id)))?;
        Ok(sale.exists().then_some(sale))
    }

    // ---- alerts ----------------------------------------------------------

    pub fn resolve_alert(
        &self,
        alert_id: AlertId,
        resolved_by: ActorId,
        notes: Option<String>,
    ) -> Result<Alert, DispatchError> {
        let now = Utc::now();
        let alert = self
            .alerts
            .resolve(alert_id, resolved_by, notes, now)
            .map_err(DispatchError::from)?;

        self.publish(Notification::new(
            EventClass::StockAlert,
            alert.medicine_id.0,
            alert.batch_id.map(|b| b.0),
            serde_json::to_value(&alert).unwrap_or_default(),
            now,
        ));
        Ok(alert)
    }

    pub fn alert(&self, alert_id: AlertId) -> Option<Alert> {
        self.alerts.get(&alert_id)
    }

    pub fn alerts(&self, active_only: bool) -> Vec<Alert> {
        self.alerts.list(active_only)
    }

    pub fn alerts_for_medicine(&self, medicine_id: MedicineId, active_only: bool) -> Vec<Alert> {
        self.alerts.list_for_medicine(medicine_id, active_only)
    }

    // ---- queries ---------------------------------------------------------

    pub fn stock_level(&self, medicine_id: MedicineId) -> Option<StockLevelRow> {
        self.levels.get(&medicine_id)
    }

    pub fn stock_levels(&self) -> Vec<StockLevelRow> {
        self.levels.list()
    }

    pub fn low_stock(&self) -> Vec<StockLevelRow> {
        self.levels.list_low_stock()
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<BatchRow> {
        self.batches.get(&batch_id)
    }

    pub fn batches(&self, query: &BatchQuery) -> Vec<BatchRow> {
        self.batches.query(query)
    }

    /// Batches inside the expiry-warning horizon (policy default unless
    /// overridden).
    pub fn expiring_batches(&self, horizon_days: Option<u32>) -> Vec<BatchRow> {
        let horizon = horizon_days.unwrap_or(self.config.alert_policy.expiry_warning_days);
        self.batches.expiring(Utc::now().date_naive(), horizon)
    }

    pub fn transactions(&self, query: &TransactionQuery) -> Vec<StockTransaction> {
        self.transactions.query(query)
    }

    /// Replay the transaction ledger from zero for one medicine.
    pub fn replay(&self, medicine_id: MedicineId) -> i64 {
        self.transactions.replay(medicine_id)
    }

    /// Consistency check: aggregate state, batch sum, ledger replay, and the
    /// stock-levels row must all agree. A divergence is a defect and is
    /// logged at the highest severity.
    pub fn verify_conservation(&self, medicine_id: MedicineId) -> Result<(), DispatchError> {
        let (stock, _) = self
            .dispatcher
            .load_aggregate(medicine_id.0, |id| MedicineStock::empty(MedicineId::new(id)))?;

        if let Err(err) = stock.check_conservation() {
            tracing::error!(%medicine_id, %err, "conservation violated in aggregate state");
            return Err(err.into());
        }

        let replayed = self.replay(medicine_id);
        if replayed != i64::from(stock.current_stock()) {
            tracing::error!(
                %medicine_id,
                replayed,
                stored = stock.current_stock(),
                "ledger replay diverged from aggregate stock"
            );
            return Err(DispatchError::InvariantViolation(format!(
                "ledger replay {} diverged from stock {} for medicine {}",
                replayed,
                stock.current_stock(),
                medicine_id
            )));
        }

        if let Some(row) = self.levels.get(&medicine_id) {
            if row.current_stock != stock.current_stock() {
                tracing::error!(
                    %medicine_id,
                    projected = row.current_stock,
                    stored = stock.current_stock(),
                    "stock-levels projection diverged from aggregate stock"
                );
                return Err(DispatchError::InvariantViolation(format!(
                    "stock-levels row {} diverged from stock {} for medicine {}",
                    row.current_stock,
                    stock.current_stock(),
                    medicine_id
                )));
            }
        }

        Ok(())
    }

    /// Rebuild every projection from the event store (offline safety net).
    pub fn rebuild_projections(&self) -> Result<(), DispatchError> {
        let envelopes: Vec<_> = self
            .store
            .load_all()?
            .iter()
            .map(StoredEvent::to_envelope)
            .collect();

        self.levels
            .rebuild_from_scratch(envelopes.clone())
            .map_err(|e| DispatchError::InvariantViolation(e.to_string()))?;
        self.transactions
            .rebuild_from_scratch(envelopes.clone())
            .map_err(|e| DispatchError::InvariantViolation(e.to_string()))?;
        self.batches
            .rebuild_from_scratch(envelopes)
            .map_err(|e| DispatchError::InvariantViolation(e.to_string()))?;
        Ok(())
    }

    // ---- fan-out ---------------------------------------------------------

    /// Register a live observer (dashboards).
    pub fn subscribe(&self) -> (SubscriberId, Subscription<Notification>) {
        self.bus.register()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.bus.unregister(id);
    }

    // ---- internals -------------------------------------------------------

    fn dispatch_stock(
        &self,
        medicine_id: MedicineId,
        command: &StockCommand,
    ) -> Result<(MedicineStock, Vec<StoredEvent>), DispatchError> {
        self.dispatcher.dispatch(
            medicine_id.0,
            streams::STOCK,
            command,
            |id| MedicineStock::empty(MedicineId::new(id)),
        )
    }

    /// Update the maintained projections from freshly committed events.
    ///
    /// A projection failure here cannot roll back the committed unit; it is
    /// logged as a defect and repaired by `rebuild_projections`.
    fn project(&self, committed: &[StoredEvent]) {
        for stored in committed {
            let envelope = stored.to_envelope();
            if let Err(err) = self.levels.apply_envelope(&envelope) {
                tracing::error!(?err, event = %stored.event_type, "stock-levels projection failed");
            }
            if let Err(err) = self.transactions.apply_envelope(&envelope) {
                tracing::error!(?err, event = %stored.event_type, "transaction-log projection failed");
            }
            if let Err(err) = self.batches.apply_envelope(&envelope) {
                tracing::error!(?err, event = %stored.event_type, "batch-directory projection failed");
            }
        }
    }

    /// Re-evaluate thresholds against post-commit state and publish alert
    /// notifications.
    fn evaluate_alerts(&self, stock: &MedicineStock) {
        let now = Utc::now();
        let desired = desired_conditions(stock, &self.config.alert_policy, now.date_naive());
        let active = self.alerts.active_conditions(stock.medicine_id());
        let delta = diff_conditions(&desired, &active);
        if delta.is_empty() {
            return;
        }

        let changes = self.alerts.apply_delta(&delta, now);
        for alert in changes.raised.iter().chain(changes.auto_resolved.iter()) {
            self.publish(Notification::new(
                EventClass::StockAlert,
                alert.medicine_id.0,
                alert.batch_id.map(|b| b.0),
                serde_json::to_value(alert).unwrap_or_default(),
                now,
            ));
        }
    }

    /// Publish inventory/expiry notifications for committed stock events.
    fn notify_stock_events(&self, committed: &[StoredEvent]) {
        for stored in committed {
            if stored.aggregate_type != streams::STOCK {
                continue;
            }
            let Ok(event) = serde_json::from_value::<StockEvent>(stored.payload.clone()) else {
                continue;
            };

            let (class, medicine_id, batch_id) = match &event {
                StockEvent::StockOpened(_) | StockEvent::ReorderLevelsSet(_) => continue,
                StockEvent::BatchReceived(e) => {
                    (EventClass::InventoryUpdate, e.medicine_id, Some(e.batch_id))
                }
                StockEvent::StockConsumed(e) => {
                    (EventClass::InventoryUpdate, e.medicine_id, Some(e.batch_id))
                }
                StockEvent::StockWrittenOff(e) => {
                    let class = match e.reason {
                        WriteOffReason::Expired => EventClass::BatchExpiry,
                        WriteOffReason::Damaged => EventClass::InventoryUpdate,
                    };
                    (class, e.medicine_id, Some(e.batch_id))
                }
                StockEvent::StockAdjusted(e) => {
                    (EventClass::InventoryUpdate, e.medicine_id, Some(e.batch_id))
                }
                StockEvent::BatchTransferred(e) => {
                    (EventClass::InventoryUpdate, e.medicine_id, Some(e.batch_id))
                }
                StockEvent::BatchRecalled(e) => {
                    (EventClass::InventoryUpdate, e.medicine_id, Some(e.batch_id))
                }
            };

            self.publish(Notification::new(
                class,
                medicine_id.0,
                batch_id.map(|b| b.0),
                stored.payload.clone(),
                stored.occurred_at,
            ));
        }
    }

    /// Fire-and-forget: a failed publication is logged, never surfaced, and
    /// never rolls back the committed unit.
    fn publish(&self, notification: Notification) {
        if let Err(err) = self.bus.broadcast(notification) {
            tracing::warn!(?err, "fan-out publication failed");
        }
    }

    fn committed_transaction(
        &self,
        committed: &[StoredEvent],
    ) -> Result<StockTransaction, DispatchError> {
        committed
            .first()
            .and_then(|stored| self.transactions.get(&stored.event_id))
            .ok_or_else(|| {
                DispatchError::InvariantViolation(
                    "committed stock event missing from transaction log".to_string(),
                )
            })
    }

    fn finish_stock_commit(&self, stock: &MedicineStock, committed: &[StoredEvent]) {
        if committed.is_empty() {
            return;
        }
        self.project(committed);
        self.evaluate_alerts(stock);
        self.notify_stock_events(committed);
    }
}
