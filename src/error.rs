//! Error taxonomy for the shift ledger.
//!
//! Domain outcomes (invalid input, conflicting state) and infrastructure
//! failures are distinct variants. Only `Busy` is ever retried, and a timeout
//! is reported as `OutcomeUnknown` rather than guessed at.

use rusqlite::ErrorCode;
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid amount for {field}: {reason}")]
    InvalidAmount { field: String, reason: String },

    #[error("no employees provided")]
    NoEmployeesProvided,

    #[error("invalid employee id {0:?}")]
    InvalidEmployeeId(String),

    #[error("a shift is already open ({})", .existing_shift_id.as_deref().unwrap_or("unknown id"))]
    ShiftAlreadyOpen { existing_shift_id: Option<String> },

    #[error("shift {0} not found")]
    ShiftNotFound(String),

    #[error("shift {0} is not open")]
    ShiftNotOpen(String),

    #[error("no active shift")]
    NoActiveShift,

    #[error("request {request_id} was already used by shift {shift_id}")]
    DuplicateRequest { request_id: String, shift_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage busy: {0}")]
    Busy(String),

    #[error("outcome of {operation} unknown after {timeout_ms} ms")]
    OutcomeUnknown {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Stable machine-readable code for the command surface.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount { .. } => "invalid_amount",
            LedgerError::NoEmployeesProvided => "no_employees_provided",
            LedgerError::InvalidEmployeeId(_) => "invalid_employee_id",
            LedgerError::ShiftAlreadyOpen { .. } => "shift_already_open",
            LedgerError::ShiftNotFound(_) => "shift_not_found",
            LedgerError::ShiftNotOpen(_) => "shift_not_open",
            LedgerError::NoActiveShift => "no_active_shift",
            LedgerError::DuplicateRequest { .. } => "duplicate_request",
            LedgerError::InvalidRequest(_) => "invalid_request",
            LedgerError::Config(_) => "config_error",
            LedgerError::Busy(_) => "storage_busy",
            LedgerError::OutcomeUnknown { .. } => "outcome_unknown",
            LedgerError::Storage(_) => "storage_error",
        }
    }

    /// True for expected business outcomes the caller can act on.
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            LedgerError::Config(_)
                | LedgerError::Busy(_)
                | LedgerError::OutcomeUnknown { .. }
                | LedgerError::Storage(_)
        )
    }

    /// Only lock contention is safe to retry: the transaction rolled back.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Busy(_))
    }

    /// Actionable message shown to the operator.
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::InvalidAmount { field, reason } => {
                format!("The amount entered for {field} is not valid ({reason}). Please correct it and try again.")
            }
            LedgerError::NoEmployeesProvided => {
                "Select at least one employee working this shift before opening it.".into()
            }
            LedgerError::InvalidEmployeeId(id) => {
                format!("Employee id {id:?} is not valid. Re-select the employees for this shift.")
            }
            LedgerError::ShiftAlreadyOpen { existing_shift_id } => match existing_shift_id {
                Some(id) => format!(
                    "A shift is already open ({id}). Resume it or close it before opening a new one."
                ),
                None => "A shift is already open. Refresh to resume it or close it before opening a new one.".into(),
            },
            LedgerError::ShiftNotFound(id) => {
                format!("Shift {id} does not exist. Refresh the shift list.")
            }
            LedgerError::ShiftNotOpen(id) => {
                format!("Shift {id} is already closed. Refresh to see its final report.")
            }
            LedgerError::NoActiveShift => {
                "No shift is open. Open a shift before recording sales.".into()
            }
            LedgerError::DuplicateRequest { shift_id, .. } => format!(
                "This request was already processed and opened shift {shift_id}. Refresh to resume it."
            ),
            LedgerError::InvalidRequest(reason) => format!("The request was rejected: {reason}."),
            LedgerError::Config(reason) => {
                format!("The ledger is misconfigured: {reason}. Contact an administrator.")
            }
            LedgerError::Busy(_) => {
                "The ledger is busy. Please try again in a moment.".into()
            }
            LedgerError::OutcomeUnknown { operation, .. } => format!(
                "The {operation} request timed out and may or may not have been applied. Refresh the active shift before trying again."
            ),
            LedgerError::Storage(_) => {
                "The ledger could not read or write its data. Check the diagnostics log.".into()
            }
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                LedgerError::Busy(err.to_string())
            }
            _ => LedgerError::Storage(err.to_string()),
        }
    }
}
