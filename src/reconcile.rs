//! Cash reconciliation for a shift close.
//!
//! expected = opening + cash portion of attributed sales
//! variance = declared closing cash - expected
//!
//! The variance is informational only: a non-zero variance never blocks a
//! close, but it is always reported.

use serde::Serialize;

use crate::models::{CashBasis, PaymentEntry, PaymentMethod};
use crate::money::Money;

/// Sales of one tender (or of no recorded tender when `method` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTotal {
    pub method: Option<PaymentMethod>,
    pub count: i64,
    pub amount: Money,
}

/// Aggregate of the sales attributed to one shift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesTally {
    pub total: Money,
    pub count: i64,
    pub by_method: Vec<MethodTotal>,
}

impl SalesTally {
    pub fn from_method_totals(by_method: Vec<MethodTotal>) -> Self {
        let total = by_method.iter().map(|m| m.amount).sum();
        let count = by_method.iter().map(|m| m.count).sum();
        SalesTally {
            total,
            count,
            by_method,
        }
    }

    /// Portion of the sales that should be sitting in the drawer.
    pub fn cash_portion(&self, basis: CashBasis) -> Money {
        match basis {
            CashBasis::AllSales => self.total,
            CashBasis::CashTender => self
                .by_method
                .iter()
                .filter(|m| matches!(m.method, None | Some(PaymentMethod::Cash)))
                .map(|m| m.amount)
                .sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub cash_basis: CashBasis,
    pub opening_cash: Money,
    pub sales_total: Money,
    pub sales_count: i64,
    pub sales_by_method: Vec<MethodTotal>,
    pub expected_cash: Money,
    /// `None` until the shift is closed.
    pub closing_cash: Option<Money>,
    /// `None` until the shift is closed.
    pub variance: Option<Money>,
    pub breakdown_total: Money,
    pub breakdown_by_method: Vec<MethodTotal>,
}

pub fn expected_cash(opening_cash: Money, basis: CashBasis, sales: &SalesTally) -> Money {
    opening_cash + sales.cash_portion(basis)
}

/// Reconcile a close.
pub fn reconcile(
    opening_cash: Money,
    basis: CashBasis,
    sales: &SalesTally,
    closing_cash: Money,
    breakdown: &[PaymentEntry],
) -> Reconciliation {
    let expected = expected_cash(opening_cash, basis, sales);
    let (breakdown_total, breakdown_by_method) = breakdown_totals(breakdown);
    Reconciliation {
        cash_basis: basis,
        opening_cash,
        sales_total: sales.total,
        sales_count: sales.count,
        sales_by_method: sales.by_method.clone(),
        expected_cash: expected,
        closing_cash: Some(closing_cash),
        variance: Some(closing_cash - expected),
        breakdown_total,
        breakdown_by_method,
    }
}

/// Running figures for a shift that is still open.
pub fn provisional(opening_cash: Money, basis: CashBasis, sales: &SalesTally) -> Reconciliation {
    Reconciliation {
        cash_basis: basis,
        opening_cash,
        sales_total: sales.total,
        sales_count: sales.count,
        sales_by_method: sales.by_method.clone(),
        expected_cash: expected_cash(opening_cash, basis, sales),
        closing_cash: None,
        variance: None,
        breakdown_total: Money::zero(),
        breakdown_by_method: Vec::new(),
    }
}

/// Group breakdown lines by tender, in a fixed method order.
pub fn breakdown_totals(breakdown: &[PaymentEntry]) -> (Money, Vec<MethodTotal>) {
    let total = breakdown.iter().map(|e| e.amount).sum();
    let by_method = PaymentMethod::ALL
        .iter()
        .filter_map(|method| {
            let lines: Vec<&PaymentEntry> =
                breakdown.iter().filter(|e| e.method == *method).collect();
            if lines.is_empty() {
                return None;
            }
            Some(MethodTotal {
                method: Some(*method),
                count: lines.len() as i64,
                amount: lines.iter().map(|e| e.amount).sum(),
            })
        })
        .collect();
    (total, by_method)
}
