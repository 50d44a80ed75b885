use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rxledger_catalog::MedicineId;
use rxledger_core::{ActorId, Aggregate, AggregateId, AggregateRoot, DomainError, Money, Percent};
use rxledger_events::Event;
use rxledger_inventory::BatchId;

use crate::math::{LineAmounts, SaleTotals, line_amounts};

/// Sale (bill) identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaleId(pub AggregateId);

impl SaleId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for SaleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Payment identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub AggregateId);

impl PaymentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

/// Opaque patient reference, owned by the patient-records collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub AggregateId);

/// Opaque prescription reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrescriptionId(pub AggregateId);

/// Human-readable bill number, printed on receipts.
///
/// Generated from a monotonic sequence, so uniqueness is structural rather
/// than probabilistic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillNumber(String);

impl BillNumber {
    pub fn from_sequence(year: i32, sequence: u64) -> Self {
        Self(format!("RX-{year}-{sequence:06}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for BillNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a payment was made.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    NetBanking,
    Insurance,
}

/// Settlement state of a sale.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
}

/// Pure function of paid vs. total; order of payments never matters.
pub fn payment_status(paid_amount: Money, total_amount: Money) -> PaymentStatus {
    if paid_amount <= Money::ZERO {
        PaymentStatus::Pending
    } else if paid_amount < total_amount {
        PaymentStatus::Partial
    } else {
        PaymentStatus::Paid
    }
}

/// One bill line, bound to the specific lot it consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_no: u32,
    pub medicine_id: MedicineId,
    pub batch_id: BatchId,
    pub quantity: u32,
    pub unit_price: Money,
    pub discount_pct: Percent,
    pub tax_pct: Percent,
    pub amounts: LineAmounts,
}

impl LineItem {
    /// Build a line with its derived amounts computed (and validated).
    pub fn compute(
        line_no: u32,
        medicine_id: MedicineId,
        batch_id: BatchId,
        quantity: u32,
        unit_price: Money,
        discount_pct: Percent,
        tax_pct: Percent,
    ) -> Result<Self, DomainError> {
        let amounts = line_amounts(quantity, unit_price, discount_pct, tax_pct)?;
        Ok(Self {
            line_no,
            medicine_id,
            batch_id,
            quantity,
            unit_price,
            discount_pct,
            tax_pct,
            amounts,
        })
    }
}

/// One appended payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub processed_by: ActorId,
    pub paid_at: DateTime<Utc>,
}

/// Aggregate root: Sale.
///
/// Created atomically with its line items and the stock events that consumed
/// each line's batch; immutable afterwards except for appended payments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    id: SaleId,
    bill_number: Option<BillNumber>,
    patient_id: Option<PatientId>,
    prescription_id: Option<PrescriptionId>,
    bill_date: Option<DateTime<Utc>>,
    items: Vec<LineItem>,
    totals: SaleTotals,
    paid_amount: Money,
    payment_status: PaymentStatus,
    payments: Vec<Payment>,
    generated_by: Option<ActorId>,
    notes: Option<String>,
    version: u64,
    created: bool,
}

impl Sale {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: SaleId) -> Self {
        Self {
            id,
            bill_number: None,
            patient_id: None,
            prescription_id: None,
            bill_date: None,
            items: Vec::new(),
            totals: SaleTotals::default(),
            paid_amount: Money::ZERO,
            payment_status: PaymentStatus::Pending,
            payments: Vec::new(),
            generated_by: None,
            notes: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SaleId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn bill_number(&self) -> Option<&BillNumber> {
        self.bill_number.as_ref()
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn prescription_id(&self) -> Option<PrescriptionId> {
        self.prescription_id
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn totals(&self) -> SaleTotals {
        self.totals
    }

    pub fn paid_amount(&self) -> Money {
        self.paid_amount
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn outstanding_amount(&self) -> Money {
        self.totals.total_amount.saturating_sub(self.paid_amount)
    }

    /// Visible credit when a sale was over-paid (refund handling is a
    /// compensating flow outside this subsystem).
    pub fn credit_balance(&self) -> Money {
        self.paid_amount.saturating_sub(self.totals.total_amount)
    }
}

impl AggregateRoot for Sale {
    type Id = SaleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateSale.
///
/// Items arrive with their batches already resolved (FEFO or pinned) and
/// their amounts computed; `handle` re-derives everything and rejects a bill
/// whose stored totals would not reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSale {
    pub sale_id: SaleId,
    pub bill_number: BillNumber,
    pub patient_id: PatientId,
    pub prescription_id: Option<PrescriptionId>,
    pub items: Vec<LineItem>,
    pub totals: SaleTotals,
    pub notes: Option<String>,
    pub generated_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyPayment {
    pub sale_id: SaleId,
    pub payment_id: PaymentId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub processed_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleCommand {
    CreateSale(CreateSale),
    ApplyPayment(ApplyPayment),
}

/// Event: SaleCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleCreated {
    pub sale_id: SaleId,
    pub bill_number: BillNumber,
    pub patient_id: PatientId,
    pub prescription_id: Option<PrescriptionId>,
    pub items: Vec<LineItem>,
    pub totals: SaleTotals,
    pub notes: Option<String>,
    pub generated_by: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentApplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentApplied {
    pub sale_id: SaleId,
    pub payment: Payment,
    pub new_paid_amount: Money,
    pub new_status: PaymentStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleEvent {
    SaleCreated(SaleCreated),
    PaymentApplied(PaymentApplied),
}

impl Event for SaleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SaleEvent::SaleCreated(_) => "pharmacy.sale.created",
            SaleEvent::PaymentApplied(_) => "pharmacy.sale.payment_applied",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SaleEvent::SaleCreated(e) => e.occurred_at,
            SaleEvent::PaymentApplied(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Sale {
    type Command = SaleCommand;
    type Event = SaleEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SaleEvent::SaleCreated(e) => {
                self.id = e.sale_id;
                self.bill_number = Some(e.bill_number.clone());
                self.patient_id = Some(e.patient_id);
                self.prescription_id = e.prescription_id;
                self.bill_date = Some(e.occurred_at);
                self.items = e.items.clone();
                self.totals = e.totals;
                self.paid_amount = Money::ZERO;
                self.payment_status = PaymentStatus::Pending;
                self.payments.clear();
                self.generated_by = Some(e.generated_by);
                self.notes = e.notes.clone();
                self.created = true;
            }
            SaleEvent::PaymentApplied(e) => {
                self.payments.push(e.payment.clone());
                self.paid_amount = e.new_paid_amount;
                self.payment_status = e.new_status;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SaleCommand::CreateSale(cmd) => self.handle_create(cmd),
            SaleCommand::ApplyPayment(cmd) => self.handle_apply_payment(cmd),
        }
    }
}

impl Sale {
    fn ensure_sale_id(&self, sale_id: SaleId) -> Result<(), DomainError> {
        if self.id != sale_id {
            return Err(DomainError::invariant("sale_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateSale) -> Result<Vec<SaleEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("sale already exists"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("cannot bill a sale without items"));
        }

        let mut totals = SaleTotals::default();
        for (idx, item) in cmd.items.iter().enumerate() {
            if item.line_no != (idx as u32) + 1 {
                return Err(DomainError::validation(format!(
                    "line numbers must be sequential (line {} at position {})",
                    item.line_no,
                    idx + 1
                )));
            }

            // Re-derive each line: a bill whose stored amounts diverge from
            // its own inputs must never be persisted.
            let expected = line_amounts(
                item.quantity,
                item.unit_price,
                item.discount_pct,
                item.tax_pct,
            )?;
            if expected != item.amounts {
                return Err(DomainError::invariant(format!(
                    "line {} amounts do not reconcile with its inputs",
                    item.line_no
                )));
            }

            totals.accumulate(&item.amounts)?;
        }

        if totals != cmd.totals || !totals.reconciles() {
            return Err(DomainError::invariant(
                "sale totals do not reconcile with line items",
            ));
        }

        Ok(vec![SaleEvent::SaleCreated(SaleCreated {
            sale_id: cmd.sale_id,
            bill_number: cmd.bill_number.clone(),
            patient_id: cmd.patient_id,
            prescription_id: cmd.prescription_id,
            items: cmd.items.clone(),
            totals: cmd.totals,
            notes: cmd.notes.clone(),
            generated_by: cmd.generated_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_apply_payment(&self, cmd: &ApplyPayment) -> Result<Vec<SaleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_sale_id(cmd.sale_id)?;

        if cmd.amount <= Money::ZERO {
            return Err(DomainError::validation("payment amount must be positive"));
        }

        // Over-payment is accepted: it yields Paid plus a visible credit
        // balance, since refund handling lives outside this subsystem.
        let new_paid_amount = self.paid_amount.checked_add(cmd.amount)?;
        let new_status = payment_status(new_paid_amount, self.totals.total_amount);

        Ok(vec![SaleEvent::PaymentApplied(PaymentApplied {
            sale_id: cmd.sale_id,
            payment: Payment {
                id: cmd.payment_id,
                amount: cmd.amount,
                method: cmd.method,
                reference: cmd.reference.clone(),
                processed_by: cmd.processed_by,
                paid_at: cmd.occurred_at,
            },
            new_paid_amount,
            new_status,
            occurred_at: cmd.occurred_at,
        })])
    }
}
