//! Billing engine: point-of-sale bills that atomically consume batch stock,
//! tax/discount-aware totals, and partial-payment tracking.

pub mod math;
pub mod sale;

pub use math::{LineAmounts, SaleTotals, line_amounts};
pub use sale::{
    ApplyPayment, BillNumber, CreateSale, LineItem, Payment, PaymentApplied, PaymentId,
    PaymentMethod, PaymentStatus, PatientId, PrescriptionId, Sale, SaleCommand, SaleCreated,
    SaleEvent, SaleId, payment_status,
};
