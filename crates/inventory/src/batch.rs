use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use rxledger_core::{AggregateId, DomainError, DomainResult, Entity, Money};

/// Batch (lot) identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub AggregateId);

impl BatchId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Human-auditable lot number, unique within a medicine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchNumber(String);

impl BatchNumber {
    pub fn new(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("batch number cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for BatchNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Batch lifecycle. A batch is never deleted, only status-transitioned, so
/// the ledger keeps referring to a real record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Available,
    OutOfStock,
    Expired,
    Damaged,
    Recalled,
}

impl BatchStatus {
    /// Whether the batch's remaining quantity counts toward the medicine's
    /// current stock. Out-of-stock batches count (with quantity zero);
    /// expired/damaged/recalled stock has left the sellable pool.
    pub fn counts_toward_stock(self) -> bool {
        matches!(self, BatchStatus::Available | BatchStatus::OutOfStock)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Expired | BatchStatus::Damaged | BatchStatus::Recalled
        )
    }
}

/// Reason for a stock write-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOffReason {
    Expired,
    Damaged,
}

impl WriteOffReason {
    /// Terminal status a fully written-off batch transitions into.
    pub fn terminal_status(self) -> BatchStatus {
        match self {
            WriteOffReason::Expired => BatchStatus::Expired,
            WriteOffReason::Damaged => BatchStatus::Damaged,
        }
    }
}

/// A dated, quantity-bounded consignment of one medicine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
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

impl Batch {
    pub fn is_available(&self) -> bool {
        self.status == BatchStatus::Available
    }

    /// Whether the expiry date has passed as of `today`.
    pub fn is_expired_by(&self, today: NaiveDate) -> bool {
        self.expiry_date <= today
    }

    /// Eligibility for automatic (FEFO) dispensing: available, stocked, and
    /// not expired as of `today`.
    pub fn is_fefo_eligible(&self, today: NaiveDate) -> bool {
        self.is_available() && self.quantity > 0 && self.expiry_date > today
    }
}

impl Entity for Batch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// First-expiry-first-out selection.
///
/// Among batches eligible as of `today` that can cover `quantity` on their
/// own (no split-batch fulfillment), picks the earliest expiry; ties break by
/// earliest received date, then by batch id, for determinism.
pub fn select_fefo<'a>(
    batches: impl IntoIterator<Item = &'a Batch>,
    quantity: u32,
    today: NaiveDate,
) -> Option<&'a Batch> {
    batches
        .into_iter()
        .filter(|b| b.is_fefo_eligible(today) && b.quantity >= quantity)
        .min_by_key(|b| (b.expiry_date, b.received_date, b.id))
}

/// Total quantity dispensable via FEFO as of `today` (for shortfall
/// reporting when no single batch can cover a request).
pub fn fefo_available_total<'a>(
    batches: impl IntoIterator<Item = &'a Batch>,
    today: NaiveDate,
) -> u32 {
    batches
        .into_iter()
        .filter(|b| b.is_fefo_eligible(today))
        .fold(0u32, |acc, b| acc.saturating_add(b.quantity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn batch(expiry: NaiveDate, received: NaiveDate, quantity: u32) -> Batch {
        Batch {
            id: BatchId::new(AggregateId::new()),
            batch_number: BatchNumber::new("BN-1").unwrap(),
            quantity,
            unit_cost: Money::from_minor(500),
            selling_price: Money::from_minor(900),
            manufacturing_date: date(2025, 1, 1),
            expiry_date: expiry,
            received_date: received,
            status: BatchStatus::Available,
            location: "shelf-a".to_string(),
        }
    }

    #[test]
    fn batch_number_rejects_blank() {
        assert!(BatchNumber::new("  ").is_err());
        assert_eq!(BatchNumber::new(" LOT-7 ").unwrap().as_str(), "LOT-7");
    }

    #[test]
    fn fefo_picks_earliest_expiry() {
        let today = date(2026, 1, 1);
        let early = batch(date(2026, 3, 1), date(2025, 6, 1), 10);
        let late = batch(date(2026, 9, 1), date(2025, 1, 1), 10);

        let batches = vec![late, early];
        let picked = select_fefo(batches.iter(), 5, today);
        assert_eq!(picked.unwrap().expiry_date, date(2026, 3, 1));
    }

    #[test]
    fn fefo_breaks_expiry_tie_by_received_date_then_id() {
        let today = date(2026, 1, 1);
        let expiry = date(2026, 6, 1);
        let older = batch(expiry, date(2025, 2, 1), 10);
        let newer = batch(expiry, date(2025, 8, 1), 10);

        let batches = vec![newer.clone(), older.clone()];
        let picked = select_fefo(batches.iter(), 5, today).unwrap();
        assert_eq!(picked.received_date, date(2025, 2, 1));

        // Same expiry and received date: the lower batch id wins.
        let mut twin_a = batch(expiry, date(2025, 2, 1), 10);
        let mut twin_b = twin_a.clone();
        twin_a.id = BatchId::new(AggregateId::from_uuid(uuid_from_byte(1)));
        twin_b.id = BatchId::new(AggregateId::from_uuid(uuid_from_byte(2)));
        let twins = vec![twin_b.clone(), twin_a.clone()];
        assert_eq!(select_fefo(twins.iter(), 5, today).unwrap().id, twin_a.id);
    }

    #[test]
    fn fefo_skips_expired_insufficient_and_unavailable() {
        let today = date(2026, 1, 1);
        let expired = batch(date(2025, 12, 31), date(2025, 1, 1), 50);
        let too_small = batch(date(2026, 2, 1), date(2025, 1, 1), 3);
        let mut damaged = batch(date(2026, 2, 15), date(2025, 1, 1), 50);
        damaged.status = BatchStatus::Damaged;
        let good = batch(date(2026, 8, 1), date(2025, 1, 1), 50);

        let batches = vec![expired, too_small.clone(), damaged, good.clone()];
        let picked = select_fefo(batches.iter(), 5, today).unwrap();
        assert_eq!(picked.expiry_date, good.expiry_date);

        // Total dispensable counts the small batch too, but not the rest.
        assert_eq!(fefo_available_total(batches.iter(), today), 53);
    }

    #[test]
    fn fefo_returns_none_when_nothing_covers_the_request() {
        let today = date(2026, 1, 1);
        let a = batch(date(2026, 2, 1), date(2025, 1, 1), 3);
        let b = batch(date(2026, 3, 1), date(2025, 1, 1), 4);

        // 7 units exist in total but no single lot covers 5.
        let batches = vec![a, b];
        assert!(select_fefo(batches.iter(), 5, today).is_none());
        assert_eq!(fefo_available_total(batches.iter(), today), 7);
    }

    fn uuid_from_byte(b: u8) -> uuid::Uuid {
        uuid::Uuid::from_bytes([b; 16])
    }
}
