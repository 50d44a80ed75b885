use serde::{Deserialize, Serialize};

use rxledger_core::{DomainError, DomainResult, ValueObject};

/// Per-medicine stock thresholds.
///
/// `reorder_level` drives the low-stock alert; min/max bound what the
/// pharmacy intends to keep on the shelf.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderLevels {
    pub min_stock_level: u32,
    pub max_stock_level: u32,
    pub reorder_level: u32,
}

impl ReorderLevels {
    pub fn new(min_stock_level: u32, max_stock_level: u32, reorder_level: u32) -> DomainResult<Self> {
        if max_stock_level < min_stock_level {
            return Err(DomainError::validation(
                "max stock level cannot be below min stock level",
            ));
        }
        if reorder_level > max_stock_level {
            return Err(DomainError::validation(
                "reorder level cannot exceed max stock level",
            ));
        }
        Ok(Self {
            min_stock_level,
            max_stock_level,
            reorder_level,
        })
    }
}

impl ValueObject for ReorderLevels {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_threshold_ordering() {
        assert!(ReorderLevels::new(5, 100, 10).is_ok());
        assert!(ReorderLevels::new(0, 0, 0).is_ok());
        assert!(ReorderLevels::new(10, 5, 7).is_err());
        assert!(ReorderLevels::new(0, 50, 60).is_err());
    }
}
