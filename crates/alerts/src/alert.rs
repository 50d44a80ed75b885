use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use rxledger_catalog::MedicineId;
use rxledger_core::{ActorId, AggregateId};
use rxledger_inventory::BatchId;

/// Alert identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub AggregateId);

impl AlertId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AlertId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Alert condition class.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowStock,
    StockOut,
    ExpiryWarning,
}

/// Alert lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// Identity of one alertable condition. At most one Active alert exists per
/// key; expiry warnings are keyed per batch, stock thresholds per medicine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConditionKey {
    pub kind: AlertKind,
    pub medicine_id: MedicineId,
    pub batch_id: Option<BatchId>,
}

impl ConditionKey {
    pub fn low_stock(medicine_id: MedicineId) -> Self {
        Self {
            kind: AlertKind::LowStock,
            medicine_id,
            batch_id: None,
        }
    }

    pub fn stock_out(medicine_id: MedicineId) -> Self {
        Self {
            kind: AlertKind::StockOut,
            medicine_id,
            batch_id: None,
        }
    }

    pub fn expiry_warning(medicine_id: MedicineId, batch_id: BatchId) -> Self {
        Self {
            kind: AlertKind::ExpiryWarning,
            medicine_id,
            batch_id: Some(batch_id),
        }
    }
}

/// One alert record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub kind: AlertKind,
    pub medicine_id: MedicineId,
    pub batch_id: Option<BatchId>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<ActorId>,
    pub notes: Option<String>,
}

impl Alert {
    pub fn condition_key(&self) -> ConditionKey {
        ConditionKey {
            kind: self.kind,
            medicine_id: self.medicine_id,
            batch_id: self.batch_id,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// Threshold-evaluation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPolicy {
    /// How far ahead of a batch's expiry date the warning fires.
    pub expiry_warning_days: u32,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            expiry_warning_days: 30,
        }
    }
}

impl AlertPolicy {
    /// Last calendar day considered "within the warning horizon".
    pub fn horizon_date(&self, today: NaiveDate) -> NaiveDate {
        today + chrono::Days::new(u64::from(self.expiry_warning_days))
    }
}
