//! The integrity-check catalogue.
//!
//! Each invariant is a small struct implementing [`Invariant`]; the
//! catalogue is registered once at bootstrap, in a fixed order the engine
//! preserves. Names are stable identifiers referenced by drift weights,
//! dashboards, and incident rows.
//!
//! Only `NO_ORPHANED_SALE_ITEMS` is safe to auto-correct: the referenced
//! sale is gone, so deleting the dangling items cannot lose reachable
//! data. Every other repair needs a human.

use aegis_core::incident::IncidentPriority;
use aegis_core::invariant::ViolationRecord;

use super::Invariant;
use crate::storage::{Storage, StorageResult};

/// Stock on hand must never go negative.
pub struct NoNegativeStock;

impl Invariant for NoNegativeStock {
    fn name(&self) -> &'static str {
        "NO_NEGATIVE_STOCK"
    }

    fn priority(&self) -> IncidentPriority {
        IncidentPriority::P1
    }

    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>> {
        storage.find_negative_stock()
    }
}

/// A confirmed sale's total must equal the sum of its line totals.
pub struct SaleTotalMatchesLineItems;

impl Invariant for SaleTotalMatchesLineItems {
    fn name(&self) -> &'static str {
        "SALE_TOTAL_MATCHES_LINE_ITEMS"
    }

    fn priority(&self) -> IncidentPriority {
        IncidentPriority::P1
    }

    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>> {
        storage.find_sale_total_mismatches()
    }
}

/// Payments plus credit must reconcile with the sale total.
pub struct PaymentSumMatchesSaleTotal;

impl Invariant for PaymentSumMatchesSaleTotal {
    fn name(&self) -> &'static str {
        "PAYMENT_SUM_MATCHES_SALE_TOTAL"
    }

    fn priority(&self) -> IncidentPriority {
        IncidentPriority::P1
    }

    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>> {
        storage.find_payment_mismatches()
    }
}

/// Invoice numbers must be unique.
pub struct NoDuplicateInvoices;

impl Invariant for NoDuplicateInvoices {
    fn name(&self) -> &'static str {
        "NO_DUPLICATE_INVOICES"
    }

    fn priority(&self) -> IncidentPriority {
        IncidentPriority::P1
    }

    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>> {
        storage.find_duplicate_invoices()
    }
}

/// Stock on hand must equal the sum of its movement deltas.
pub struct StockMovementBalance;

impl Invariant for StockMovementBalance {
    fn name(&self) -> &'static str {
        "STOCK_MOVEMENT_BALANCE"
    }

    fn priority(&self) -> IncidentPriority {
        IncidentPriority::P2
    }

    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>> {
        storage.find_stock_movement_imbalances()
    }
}

/// Outstanding customer credit must stay within 105 % of the limit.
pub struct CreditLimitNotExceeded;

impl Invariant for CreditLimitNotExceeded {
    fn name(&self) -> &'static str {
        "CREDIT_LIMIT_NOT_EXCEEDED"
    }

    fn priority(&self) -> IncidentPriority {
        IncidentPriority::P2
    }

    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>> {
        storage.find_credit_limit_breaches()
    }
}

/// Sale items must reference an existing sale. Orphans are deleted.
pub struct NoOrphanedSaleItems;

impl Invariant for NoOrphanedSaleItems {
    fn name(&self) -> &'static str {
        "NO_ORPHANED_SALE_ITEMS"
    }

    fn priority(&self) -> IncidentPriority {
        IncidentPriority::P3
    }

    fn safe_to_auto_correct(&self) -> bool {
        true
    }

    fn check(&self, storage: &Storage) -> StorageResult<Vec<ViolationRecord>> {
        storage.find_orphaned_sale_items()
    }

    fn auto_correct(
        &self,
        storage: &Storage,
        violations: &[ViolationRecord],
    ) -> StorageResult<()> {
        let ids: Vec<String> = violations.iter().map(|v| v.entity_id.clone()).collect();
        storage.delete_sale_items(&ids)?;
        Ok(())
    }
}

/// The catalogue in registration order.
#[must_use]
pub fn default_catalogue() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(NoNegativeStock),
        Box::new(SaleTotalMatchesLineItems),
        Box::new(PaymentSumMatchesSaleTotal),
        Box::new(NoDuplicateInvoices),
        Box::new(StockMovementBalance),
        Box::new(CreditLimitNotExceeded),
        Box::new(NoOrphanedSaleItems),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_order_and_flags() {
        let catalogue = default_catalogue();
        let names: Vec<&str> = catalogue.iter().map(|i| i.name()).collect();
        assert_eq!(
            names,
            vec![
                "NO_NEGATIVE_STOCK",
                "SALE_TOTAL_MATCHES_LINE_ITEMS",
                "PAYMENT_SUM_MATCHES_SALE_TOTAL",
                "NO_DUPLICATE_INVOICES",
                "STOCK_MOVEMENT_BALANCE",
                "CREDIT_LIMIT_NOT_EXCEEDED",
                "NO_ORPHANED_SALE_ITEMS",
            ]
        );
        let correctable: Vec<&str> = catalogue
            .iter()
            .filter(|i| i.safe_to_auto_correct())
            .map(|i| i.name())
            .collect();
        assert_eq!(correctable, vec!["NO_ORPHANED_SALE_ITEMS"]);
    }
}
