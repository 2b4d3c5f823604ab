//! Typed records shared by the ledger modules and the command surface.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::LedgerError;
use crate::money::Money;

/// Scope key used for every shift when the station runs one register.
pub const GLOBAL_SCOPE_KEY: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Open,
    Closed,
}

impl ShiftStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ShiftStatus::Open => "open",
            ShiftStatus::Closed => "closed",
        }
    }
}

impl FromStr for ShiftStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ShiftStatus::Open),
            "closed" => Ok(ShiftStatus::Closed),
            other => Err(LedgerError::InvalidRequest(format!(
                "unknown shift status {other:?}"
            ))),
        }
    }
}

/// Boundary inside which at most one shift may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftScope {
    Global,
    PerEmployee,
}

impl ShiftScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ShiftScope::Global => "global",
            ShiftScope::PerEmployee => "per_employee",
        }
    }

    /// Resolve the uniqueness key for an acting employee.
    pub fn key_for(self, acting_employee: Option<&str>) -> Result<String, LedgerError> {
        match self {
            ShiftScope::Global => Ok(GLOBAL_SCOPE_KEY.to_string()),
            ShiftScope::PerEmployee => acting_employee
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .ok_or_else(|| {
                    LedgerError::InvalidRequest(
                        "an acting employee id is required when shifts are scoped per employee"
                            .into(),
                    )
                }),
        }
    }
}

impl FromStr for ShiftScope {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" | "system" => Ok(ShiftScope::Global),
            "per_employee" | "per-employee" | "employee" => Ok(ShiftScope::PerEmployee),
            other => Err(LedgerError::Config(format!("unknown shift scope {other:?}"))),
        }
    }
}

/// Which sales count towards the cash expected in the drawer at close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CashBasis {
    /// Every attributed sale is assumed to have been paid into the drawer.
    AllSales,
    /// Only sales tendered in cash, or with no recorded tender, count.
    CashTender,
}

impl CashBasis {
    pub fn as_str(self) -> &'static str {
        match self {
            CashBasis::AllSales => "all_sales",
            CashBasis::CashTender => "cash_tender",
        }
    }
}

impl FromStr for CashBasis {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all_sales" | "all" => Ok(CashBasis::AllSales),
            "cash_tender" | "cash" => Ok(CashBasis::CashTender),
            other => Err(LedgerError::Config(format!("unknown cash basis {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    Credit,
    Voucher,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 5] = [
        PaymentMethod::Cash,
        PaymentMethod::Card,
        PaymentMethod::BankTransfer,
        PaymentMethod::Credit,
        PaymentMethod::Voucher,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Credit => "credit",
            PaymentMethod::Voucher => "voucher",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" | "credit_card" | "debit_card" => Ok(PaymentMethod::Card),
            "bank_transfer" | "transfer" => Ok(PaymentMethod::BankTransfer),
            "credit" | "account" => Ok(PaymentMethod::Credit),
            "voucher" | "coupon" => Ok(PaymentMethod::Voucher),
            other => Err(LedgerError::InvalidRequest(format!(
                "unknown payment method {other:?}"
            ))),
        }
    }
}

/// One line of the payment breakdown declared at close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEntry {
    pub method: PaymentMethod,
    pub amount: Money,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: String,
    pub status: ShiftStatus,
    pub scope_key: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub opening_cash: Money,
    pub closing_cash: Option<Money>,
    pub expected_cash: Option<Money>,
    pub variance: Option<Money>,
    pub cash_basis: CashBasis,
    pub employee_ids: Vec<String>,
    pub opened_by: Option<String>,
    pub closed_by: Option<String>,
    pub client_request_id: Option<String>,
    /// Live sum of attributed sales.
    pub sales_total: Money,
    pub sales_count: i64,
    pub payment_breakdown: Vec<PaymentEntry>,
}

impl Shift {
    pub fn is_open(&self) -> bool {
        self.status == ShiftStatus::Open
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: String,
    pub shift_id: String,
    pub employee_id: String,
    pub amount: Money,
    pub payment_method: Option<PaymentMethod>,
    pub product: Option<String>,
    pub quantity: Option<Decimal>,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OpenShiftRequest {
    pub opening_cash: Money,
    pub employee_ids: Vec<String>,
    pub opened_by: Option<String>,
    pub client_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CloseShiftRequest {
    pub shift_id: String,
    pub closing_cash: Money,
    pub payment_breakdown: Vec<PaymentEntry>,
    pub closed_by: Option<String>,
}

/// Sale details as supplied by the recorder. The shift id is resolved by the
/// ledger, never by the caller.
#[derive(Debug, Clone)]
pub struct SaleDetails {
    pub employee_id: String,
    pub amount: Money,
    pub payment_method: Option<PaymentMethod>,
    pub product: Option<String>,
    pub quantity: Option<Decimal>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShiftFilter {
    pub status: Option<ShiftStatus>,
    pub opened_from: Option<DateTime<Utc>>,
    pub opened_to: Option<DateTime<Utc>>,
    pub employee_id: Option<String>,
    pub limit: Option<u32>,
}

/// Normalize an employee id set: trim, reject blanks, drop duplicates while
/// keeping first-seen order.
pub fn normalize_employee_ids(ids: &[String]) -> Result<Vec<String>, LedgerError> {
    if ids.is_empty() {
        return Err(LedgerError::NoEmployeesProvided);
    }
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for raw in ids {
        let id = raw.trim();
        if id.is_empty() {
            return Err(LedgerError::InvalidEmployeeId(raw.clone()));
        }
        if !out.iter().any(|seen| seen == id) {
            out.push(id.to_string());
        }
    }
    Ok(out)
}
