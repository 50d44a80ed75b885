//! Pure threshold evaluation.
//!
//! The engine computes the *desired* set of active conditions from stock
//! state, then diffs it against what is currently active. Re-running the
//! evaluation on unchanged state yields an empty delta, which is what makes
//! re-triggering an already-active alert a no-op.

use std::collections::BTreeSet;

use chrono::NaiveDate;

use rxledger_inventory::MedicineStock;

use crate::alert::{AlertPolicy, ConditionKey};

/// Conditions to raise and to auto-resolve, computed by [`diff_conditions`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlertDelta {
    pub raise: Vec<ConditionKey>,
    pub resolve: Vec<ConditionKey>,
}

impl AlertDelta {
    pub fn is_empty(&self) -> bool {
        self.raise.is_empty() && self.resolve.is_empty()
    }
}

/// The set of conditions that *should* be active for this medicine's stock
/// as of `today`.
///
/// - StockOut: current stock is zero (only once stock has ever been
///   received; a freshly ensured record with no batches is not alertable).
/// - LowStock: current stock is positive but at or below the reorder level.
/// - ExpiryWarning: per batch. Available, still stocked, and expiring
///   within the policy horizon. Batches already moved to the Expired
///   lifecycle state are not re-alerted.
pub fn desired_conditions(
    stock: &MedicineStock,
    policy: &AlertPolicy,
    today: NaiveDate,
) -> BTreeSet<ConditionKey> {
    let mut desired = BTreeSet::new();

    if !stock.exists() {
        return desired;
    }

    let medicine_id = stock.medicine_id();
    let has_history = stock.batches().next().is_some();
    let current = stock.current_stock();
    let reorder = stock.levels().reorder_level;

    if current == 0 {
        if has_history {
            desired.insert(ConditionKey::stock_out(medicine_id));
        }
    } else if current <= reorder {
        desired.insert(ConditionKey::low_stock(medicine_id));
    }

    let horizon = policy.horizon_date(today);
    for batch in stock.batches() {
        if batch.is_available() && batch.quantity > 0 && batch.expiry_date <= horizon {
            desired.insert(ConditionKey::expiry_warning(medicine_id, batch.id));
        }
    }

    desired
}

/// Diff desired conditions against the currently active set.
///
/// Only keys belonging to this medicine should be passed in `active`;
/// everything in `active` but not `desired` auto-resolves, everything in
/// `desired` but not `active` is raised.
pub fn diff_conditions(
    desired: &BTreeSet<ConditionKey>,
    active: &BTreeSet<ConditionKey>,
) -> AlertDelta {
    AlertDelta {
        raise: desired.difference(active).copied().collect(),
        resolve: active.difference(desired).copied().collect(),
    }
}
