//! Tax/discount-aware line and bill arithmetic.
//!
//! All derived amounts round half-up to the currency's minor unit as they are
//! computed, so every printed line reconciles with the bill totals exactly.

use serde::{Deserialize, Serialize};

use rxledger_core::{DomainError, DomainResult, Money, Percent};

/// Derived amounts for one line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAmounts {
    pub subtotal: Money,
    pub discount: Money,
    pub taxable: Money,
    pub tax: Money,
    pub total: Money,
}

/// Bill-level aggregation across line items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaleTotals {
    pub subtotal: Money,
    pub discount: Money,
    pub tax: Money,
    pub total_amount: Money,
}

impl SaleTotals {
    pub fn accumulate(&mut self, line: &LineAmounts) -> DomainResult<()> {
        self.subtotal = self.subtotal.checked_add(line.subtotal)?;
        self.discount = self.discount.checked_add(line.discount)?;
        self.tax = self.tax.checked_add(line.tax)?;
        self.total_amount = self.total_amount.checked_add(line.total)?;
        Ok(())
    }

    /// `total_amount == subtotal - discount + tax` must hold by construction;
    /// this re-derives it for invariant checking.
    pub fn reconciles(&self) -> bool {
        self.subtotal
            .checked_sub(self.discount)
            .and_then(|taxable| taxable.checked_add(self.tax))
            .map(|total| total == self.total_amount)
            .unwrap_or(false)
    }
}

/// Compute the derived amounts of one line.
///
/// `item_subtotal = quantity × unit_price`, `discount = subtotal × pct`,
/// `taxable = subtotal − discount`, `tax = taxable × pct`,
/// `total = taxable + tax`.
pub fn line_amounts(
    quantity: u32,
    unit_price: Money,
    discount_pct: Percent,
    tax_pct: Percent,
) -> DomainResult<LineAmounts> {
    if quantity == 0 {
        return Err(DomainError::validation("line quantity must be positive"));
    }
    if unit_price <= Money::ZERO {
        return Err(DomainError::validation("unit price must be positive"));
    }

    let subtotal = unit_price.checked_mul(quantity)?;
    let discount = discount_pct.of(subtotal);
    let taxable = subtotal.checked_sub(discount)?;
    let tax = tax_pct.of(taxable);
    let total = taxable.checked_add(tax)?;

    Ok(LineAmounts {
        subtotal,
        discount,
        taxable,
        tax,
        total,
    })
}
