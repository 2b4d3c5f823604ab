//! Shift lifecycle: open, close with cash reconciliation, and lookups.
//!
//! At most one shift may be open per scope key. The rule lives in the schema
//! (a partial unique index); `open_shift` performs a plain insert inside an
//! IMMEDIATE transaction and translates the index violation into
//! `ShiftAlreadyOpen`. Closing recomputes the sales total in the same write
//! transaction that flips the status, so no sale can slip in between.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ensure_pinned_scope, LedgerPolicy};
use crate::db::{format_ts, parse_ts, with_immediate_tx, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    normalize_employee_ids, CloseShiftRequest, OpenShiftRequest, PaymentEntry, Shift,
    ShiftFilter, ShiftScope, ShiftStatus,
};
use crate::money::Money;
use crate::reconcile::{self, Reconciliation};
use crate::sales;
use crate::sync;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

const SHIFT_COLUMNS: &str = "id, scope_key, status, opened_at, closed_at, opening_minor,
     closing_minor, expected_minor, variance_minor, cash_basis, opened_by, closed_by,
     client_request_id";

/// Result of a successful close.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedShift {
    pub shift: Shift,
    pub reconciliation: Reconciliation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftSummary {
    pub shift: Shift,
    pub reconciliation: Reconciliation,
    /// True while the shift is open and the figures can still move.
    pub provisional: bool,
}

// ---------------------------------------------------------------------------
// Open shift
// ---------------------------------------------------------------------------

/// Open a new shift in the scope of the acting employee.
///
/// Under per-employee scope the opener must be on the crew, and nobody on the
/// crew may already belong to another open shift.
pub fn open_shift(
    db: &DbState,
    policy: &LedgerPolicy,
    req: &OpenShiftRequest,
) -> LedgerResult<Shift> {
    let opening_cash = req.opening_cash.non_negative("opening_cash")?;
    let opening_minor = opening_cash.to_minor()?;
    let employee_ids = normalize_employee_ids(&req.employee_ids)?;
    let opened_by = trimmed(req.opened_by.as_deref());
    let client_request_id = trimmed(req.client_request_id.as_deref());

    if policy.scope == ShiftScope::PerEmployee {
        if let Some(opener) = opened_by.as_deref() {
            if !employee_ids.iter().any(|id| id == opener) {
                return Err(LedgerError::InvalidRequest(format!(
                    "openedBy {opener:?} must be one of employeeIds"
                )));
            }
        }
    }

    let acting = opened_by
        .as_deref()
        .or_else(|| employee_ids.first().map(String::as_str));
    let scope_key = policy.scope.key_for(acting)?;

    let shift_id = Uuid::new_v4().to_string();
    let now = format_ts(Utc::now());

    let conn = db.lock()?;
    let result = with_immediate_tx(&conn, |conn| {
        ensure_pinned_scope(conn, policy.scope)?;

        if let Some(request_id) = client_request_id.as_deref() {
            if let Some(existing) = shift_id_for_request(conn, request_id)? {
                return Err(LedgerError::DuplicateRequest {
                    request_id: request_id.to_string(),
                    shift_id: existing,
                });
            }
        }

        if policy.scope == ShiftScope::PerEmployee {
            for employee_id in &employee_ids {
                if let Some(existing) =
                    open_shift_id_for(conn, policy.scope, Some(employee_id.as_str()))?
                {
                    debug!(
                        employee_id = %employee_id,
                        shift_id = %existing,
                        "Crew member already on an open shift"
                    );
                    return Err(LedgerError::ShiftAlreadyOpen {
                        existing_shift_id: Some(existing),
                    });
                }
            }
        }

        let inserted = conn.execute(
            "INSERT INTO shifts (
                id, scope_key, status, opened_at, opening_minor, cash_basis,
                opened_by, client_request_id, created_at, updated_at
            ) VALUES (?1, ?2, 'open', ?3, ?4, ?5, ?6, ?7, ?3, ?3)",
            params![
                shift_id,
                scope_key,
                now,
                opening_minor,
                policy.cash_basis.as_str(),
                opened_by,
                client_request_id,
            ],
        );
        if let Err(e) = inserted {
            return Err(open_conflict(conn, e, &scope_key, client_request_id.as_deref()));
        }

        for (position, employee_id) in employee_ids.iter().enumerate() {
            conn.execute(
                "INSERT INTO shift_employees (shift_id, employee_id, position)
                 VALUES (?1, ?2, ?3)",
                params![shift_id, employee_id, position as i64],
            )?;
        }

        sync::enqueue(
            conn,
            "shift",
            &shift_id,
            "open",
            &serde_json::json!({
                "shiftId": shift_id,
                "scopeKey": scope_key,
                "openedAt": now,
                "openingCash": opening_cash,
                "cashBasis": policy.cash_basis,
                "employeeIds": employee_ids,
                "openedBy": opened_by,
                "clientRequestId": client_request_id,
            }),
        )?;

        load_shift(conn, &shift_id)?
            .ok_or_else(|| LedgerError::Storage(format!("shift {shift_id} vanished after insert")))
    });

    match result {
        Ok(shift) => {
            info!(
                shift_id = %shift.id,
                scope_key = %shift.scope_key,
                opening_cash = %shift.opening_cash,
                employees = shift.employee_ids.len(),
                "Shift opened"
            );
            Ok(shift)
        }
        Err(e) => {
            warn!(scope_key = %scope_key, error = %e, "Shift open rejected");
            Err(e)
        }
    }
}

/// Translate a failed shift insert. Only the two unique indexes are domain
/// outcomes; everything else stays a storage error.
fn open_conflict(
    conn: &Connection,
    err: rusqlite::Error,
    scope_key: &str,
    client_request_id: Option<&str>,
) -> LedgerError {
    let Some(message) = unique_violation(&err) else {
        return err.into();
    };

    if message.contains("shifts.scope_key") {
        let existing_shift_id = conn
            .query_row(
                "SELECT id FROM shifts WHERE scope_key = ?1 AND status = 'open'",
                params![scope_key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .ok()
            .flatten();
        return LedgerError::ShiftAlreadyOpen { existing_shift_id };
    }

    if message.contains("shifts.client_request_id") {
        if let Some(request_id) = client_request_id {
            let shift_id = shift_id_for_request(conn, request_id)
                .ok()
                .flatten()
                .unwrap_or_default();
            return LedgerError::DuplicateRequest {
                request_id: request_id.to_string(),
                shift_id,
            };
        }
    }

    err.into()
}

fn unique_violation(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(message))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Some(message.as_str())
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Close shift
// ---------------------------------------------------------------------------

/// Close an open shift and reconcile its drawer.
///
/// A non-zero variance never blocks the close.
pub fn close_shift(db: &DbState, req: &CloseShiftRequest) -> LedgerResult<ClosedShift> {
    let closing_cash = req.closing_cash.non_negative("closing_cash")?;
    let closing_minor = closing_cash.to_minor()?;
    let mut breakdown_minor = Vec::with_capacity(req.payment_breakdown.len());
    for (i, entry) in req.payment_breakdown.iter().enumerate() {
        let field = format!("payment_breakdown[{i}].amount");
        breakdown_minor.push(entry.amount.non_negative(&field)?.to_minor()?);
    }
    let closed_by = trimmed(req.closed_by.as_deref());
    let shift_id = req.shift_id.trim();
    if shift_id.is_empty() {
        return Err(LedgerError::InvalidRequest("shift id is required".into()));
    }

    let conn = db.lock()?;
    let result = with_immediate_tx(&conn, |conn| {
        let shift = load_shift(conn, shift_id)?
            .ok_or_else(|| LedgerError::ShiftNotFound(shift_id.to_string()))?;
        if !shift.is_open() {
            return Err(LedgerError::ShiftNotOpen(shift.id));
        }

        let tally = sales::tally_for_shift(conn, &shift.id)?;
        let reconciliation = reconcile::reconcile(
            shift.opening_cash,
            shift.cash_basis,
            &tally,
            closing_cash,
            &req.payment_breakdown,
        );
        let expected_minor = reconciliation.expected_cash.to_minor()?;
        let variance_minor = (closing_cash - reconciliation.expected_cash).to_minor()?;

        for (position, (entry, amount_minor)) in req
            .payment_breakdown
            .iter()
            .zip(&breakdown_minor)
            .enumerate()
        {
            conn.execute(
                "INSERT INTO shift_payments (shift_id, position, method, amount_minor, reference)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    shift.id,
                    position as i64,
                    entry.method.as_str(),
                    amount_minor,
                    entry.reference,
                ],
            )?;
        }

        let now = format_ts(Utc::now());
        let changed = conn.execute(
            "UPDATE shifts SET
                status = 'closed',
                closed_at = ?1,
                closing_minor = ?2,
                expected_minor = ?3,
                variance_minor = ?4,
                closed_by = ?5,
                updated_at = ?1
             WHERE id = ?6 AND status = 'open'",
            params![
                now,
                closing_minor,
                expected_minor,
                variance_minor,
                closed_by,
                shift.id
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::ShiftNotOpen(shift.id));
        }

        sync::enqueue(
            conn,
            "shift",
            &shift.id,
            "close",
            &serde_json::json!({
                "shiftId": shift.id,
                "closedAt": now,
                "closedBy": closed_by,
                "openingCash": shift.opening_cash,
                "closingCash": closing_cash,
                "expectedCash": reconciliation.expected_cash,
                "variance": reconciliation.variance,
                "salesTotal": reconciliation.sales_total,
                "salesCount": reconciliation.sales_count,
                "cashBasis": shift.cash_basis,
                "paymentBreakdown": req.payment_breakdown,
            }),
        )?;

        let closed = load_shift(conn, &shift.id)?
            .ok_or_else(|| LedgerError::ShiftNotFound(shift.id.clone()))?;
        Ok(ClosedShift {
            shift: closed,
            reconciliation,
        })
    });

    match result {
        Ok(closed) => {
            let variance = closed.reconciliation.variance.unwrap_or_default();
            if variance.is_zero() {
                info!(
                    shift_id = %closed.shift.id,
                    sales_total = %closed.reconciliation.sales_total,
                    expected_cash = %closed.reconciliation.expected_cash,
                    "Shift closed, drawer balanced"
                );
            } else {
                info!(
                    shift_id = %closed.shift.id,
                    sales_total = %closed.reconciliation.sales_total,
                    expected_cash = %closed.reconciliation.expected_cash,
                    variance = %variance,
                    "Shift closed with cash variance"
                );
            }
            Ok(closed)
        }
        Err(e) => {
            warn!(shift_id = %shift_id, error = %e, "Shift close rejected");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// The open shift an employee works on, if any. The employee is ignored
/// under the global scope.
pub fn get_active(
    db: &DbState,
    scope: ShiftScope,
    employee_id: Option<&str>,
) -> LedgerResult<Option<Shift>> {
    let conn = db.lock()?;
    match open_shift_id_for(&conn, scope, employee_id)? {
        Some(id) => load_shift(&conn, &id),
        None => Ok(None),
    }
}

/// Resolve the open shift for an employee. Under per-employee scope this is
/// the open shift whose crew lists them; opens keep that at most one.
pub(crate) fn open_shift_id_for(
    conn: &Connection,
    scope: ShiftScope,
    employee_id: Option<&str>,
) -> LedgerResult<Option<String>> {
    let key = scope.key_for(employee_id)?;
    let sql = match scope {
        ShiftScope::Global => "SELECT id FROM shifts WHERE scope_key = ?1 AND status = 'open'",
        ShiftScope::PerEmployee => {
            "SELECT s.id FROM shifts s
             JOIN shift_employees e ON e.shift_id = s.id
             WHERE e.employee_id = ?1 AND s.status = 'open'
             ORDER BY s.opened_at, s.rowid
             LIMIT 1"
        }
    };
    Ok(conn
        .query_row(sql, params![key], |row| row.get(0))
        .optional()?)
}

pub fn get_shift(db: &DbState, shift_id: &str) -> LedgerResult<Option<Shift>> {
    let conn = db.lock()?;
    load_shift(&conn, shift_id)
}

/// Look up the shift opened by a given idempotency key.
pub fn find_by_request(db: &DbState, client_request_id: &str) -> LedgerResult<Option<Shift>> {
    let conn = db.lock()?;
    match shift_id_for_request(&conn, client_request_id.trim())? {
        Some(id) => load_shift(&conn, &id),
        None => Ok(None),
    }
}

/// Shifts matching the filter, newest first.
pub fn list_shifts(db: &DbState, filter: &ShiftFilter) -> LedgerResult<Vec<Shift>> {
    let limit = filter
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(from) = filter.opened_from {
        clauses.push("opened_at >= ?");
        args.push(SqlValue::Text(format_ts(from)));
    }
    if let Some(to) = filter.opened_to {
        clauses.push("opened_at <= ?");
        args.push(SqlValue::Text(format_ts(to)));
    }
    if let Some(employee_id) = trimmed(filter.employee_id.as_deref()) {
        clauses.push("id IN (SELECT shift_id FROM shift_employees WHERE employee_id = ?)");
        args.push(SqlValue::Text(employee_id));
    }
    args.push(SqlValue::Integer(i64::from(limit)));

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id FROM shifts {where_sql} ORDER BY opened_at DESC, rowid DESC LIMIT ?"
    );
    debug!(sql = %sql, "Listing shifts");

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(args), |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut shifts = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(shift) = load_shift(&conn, &id)? {
            shifts.push(shift);
        }
    }
    Ok(shifts)
}

/// Reconciliation report for a shift. Closed shifts report the figures stored
/// at close; open shifts report a running expected cash with no variance.
pub fn shift_summary(db: &DbState, shift_id: &str) -> LedgerResult<ShiftSummary> {
    let conn = db.lock()?;
    let shift = load_shift(&conn, shift_id)?
        .ok_or_else(|| LedgerError::ShiftNotFound(shift_id.to_string()))?;
    let tally = sales::tally_for_shift(&conn, &shift.id)?;

    if shift.is_open() {
        let reconciliation = reconcile::provisional(shift.opening_cash, shift.cash_basis, &tally);
        return Ok(ShiftSummary {
            shift,
            reconciliation,
            provisional: true,
        });
    }

    let closing_cash = shift.closing_cash.unwrap_or_default();
    let mut reconciliation = reconcile::reconcile(
        shift.opening_cash,
        shift.cash_basis,
        &tally,
        closing_cash,
        &shift.payment_breakdown,
    );
    if let (Some(expected), Some(variance)) = (shift.expected_cash, shift.variance) {
        if reconciliation.variance != Some(variance) {
            warn!(
                shift_id = %shift.id,
                stored = %variance,
                recomputed = %reconciliation.variance.unwrap_or_default(),
                "Stored variance differs from recomputed figures"
            );
        }
        reconciliation.expected_cash = expected;
        reconciliation.variance = Some(variance);
    }

    Ok(ShiftSummary {
        shift,
        reconciliation,
        provisional: false,
    })
}

// ---------------------------------------------------------------------------
// Row hydration
// ---------------------------------------------------------------------------

struct ShiftRow {
    id: String,
    scope_key: String,
    status: String,
    opened_at: String,
    closed_at: Option<String>,
    opening_minor: i64,
    closing_minor: Option<i64>,
    expected_minor: Option<i64>,
    variance_minor: Option<i64>,
    cash_basis: String,
    opened_by: Option<String>,
    closed_by: Option<String>,
    client_request_id: Option<String>,
}

/// Load a shift with its crew, breakdown and live sales total.
fn load_shift(conn: &Connection, shift_id: &str) -> LedgerResult<Option<Shift>> {
    let row = conn
        .query_row(
            &format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE id = ?1"),
            params![shift_id],
            |row| {
                Ok(ShiftRow {
                    id: row.get(0)?,
                    scope_key: row.get(1)?,
                    status: row.get(2)?,
                    opened_at: row.get(3)?,
                    closed_at: row.get(4)?,
                    opening_minor: row.get(5)?,
                    closing_minor: row.get(6)?,
                    expected_minor: row.get(7)?,
                    variance_minor: row.get(8)?,
                    cash_basis: row.get(9)?,
                    opened_by: row.get(10)?,
                    closed_by: row.get(11)?,
                    client_request_id: row.get(12)?,
                })
            },
        )
        .optional()?;

    match row {
        Some(row) => hydrate(conn, row).map(Some),
        None => Ok(None),
    }
}

fn hydrate(conn: &Connection, row: ShiftRow) -> LedgerResult<Shift> {
    let status: ShiftStatus = row
        .status
        .parse()
        .map_err(|_| LedgerError::Storage(format!("bad stored shift status {:?}", row.status)))?;
    let cash_basis = row
        .cash_basis
        .parse()
        .map_err(|_| LedgerError::Storage(format!("bad stored cash basis {:?}", row.cash_basis)))?;

    let mut stmt = conn.prepare(
        "SELECT employee_id FROM shift_employees WHERE shift_id = ?1 ORDER BY position ASC",
    )?;
    let employee_ids = stmt
        .query_map(params![row.id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let payment_breakdown = load_breakdown(conn, &row.id)?;
    let tally = sales::tally_for_shift(conn, &row.id)?;

    Ok(Shift {
        status,
        scope_key: row.scope_key,
        opened_at: parse_ts(&row.opened_at)?,
        closed_at: row.closed_at.as_deref().map(parse_ts).transpose()?,
        opening_cash: Money::from_minor(row.opening_minor),
        closing_cash: row.closing_minor.map(Money::from_minor),
        expected_cash: row.expected_minor.map(Money::from_minor),
        variance: row.variance_minor.map(Money::from_minor),
        cash_basis,
        employee_ids,
        opened_by: row.opened_by,
        closed_by: row.closed_by,
        client_request_id: row.client_request_id,
        sales_total: tally.total,
        sales_count: tally.count,
        payment_breakdown,
        id: row.id,
    })
}

fn load_breakdown(conn: &Connection, shift_id: &str) -> LedgerResult<Vec<PaymentEntry>> {
    let mut stmt = conn.prepare(
        "SELECT method, amount_minor, reference FROM shift_payments
         WHERE shift_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt
        .query_map(params![shift_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(method, amount_minor, reference)| {
            Ok(PaymentEntry {
                method: method.parse().map_err(|_| {
                    LedgerError::Storage(format!("bad stored payment method {method:?}"))
                })?,
                amount: Money::from_minor(amount_minor),
                reference,
            })
        })
        .collect()
}

fn shift_id_for_request(conn: &Connection, client_request_id: &str) -> LedgerResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM shifts WHERE client_request_id = ?1",
            params![client_request_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{CashBasis, PaymentMethod, SaleDetails, ShiftScope};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn units(n: i64) -> Money {
        Money::from_minor(n * 100)
    }

    fn open_req(opening: i64, employees: &[&str]) -> OpenShiftRequest {
        OpenShiftRequest {
            opening_cash: units(opening),
            employee_ids: employees.iter().map(|e| e.to_string()).collect(),
            opened_by: None,
            client_request_id: None,
        }
    }

    fn close_req(shift_id: &str, closing: i64, breakdown: Vec<PaymentEntry>) -> CloseShiftRequest {
        CloseShiftRequest {
            shift_id: shift_id.to_string(),
            closing_cash: units(closing),
            payment_breakdown: breakdown,
            closed_by: Some("e1".into()),
        }
    }

    fn sell(db: &DbState, employee: &str, amount: i64) {
        sales::create_sale(
            db,
            ShiftScope::Global,
            &SaleDetails {
                employee_id: employee.into(),
                amount: units(amount),
                payment_method: None,
                product: None,
                quantity: None,
                reference: None,
            },
        )
        .unwrap();
    }

    fn outbox_keys(db: &DbState) -> Vec<String> {
        let conn = db.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT idempotency_key FROM sync_queue ORDER BY id")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_open_validates_inputs() {
        let db = db::test_db();
        let policy = LedgerPolicy::default();

        let mut negative = open_req(0, &["e1"]);
        negative.opening_cash = units(-1);
        assert!(matches!(
            open_shift(&db, &policy, &negative),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            open_shift(&db, &policy, &open_req(0, &[])),
            Err(LedgerError::NoEmployeesProvided)
        ));
        assert!(get_active(&db, ShiftScope::Global, None).unwrap().is_none());

        let shift = open_shift(&db, &policy, &open_req(5000, &["e1"])).unwrap();
        assert_eq!(shift.status, ShiftStatus::Open);
        assert_eq!(shift.opening_cash, units(5000));
        assert_eq!(shift.employee_ids, vec!["e1"]);
        assert!(shift.closed_at.is_none());
        assert!(shift.variance.is_none());
    }

    #[test]
    fn test_second_open_in_scope_reports_existing_shift() {
        let db = db::test_db();
        let policy = LedgerPolicy::default();
        let first = open_shift(&db, &policy, &open_req(100, &["e1"])).unwrap();

        let err = open_shift(&db, &policy, &open_req(100, &["e2"])).unwrap_err();
        match err {
            LedgerError::ShiftAlreadyOpen { existing_shift_id } => {
                assert_eq!(existing_shift_id.as_deref(), Some(first.id.as_str()));
            }
            other => panic!("expected ShiftAlreadyOpen, got {other:?}"),
        }

        let conn = db.lock().unwrap();
        let open: i64 = conn
            .query_row("SELECT COUNT(*) FROM shifts WHERE status = 'open'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(open, 1);
    }

    #[test]
    fn test_racing_opens_on_separate_connections() {
        let dir = std::env::temp_dir().join(format!("station-ledger-race-{}", Uuid::new_v4()));
        let first = Arc::new(db::init(&dir, Duration::from_secs(5)).unwrap());
        let second = Arc::new(db::init(&dir, Duration::from_secs(5)).unwrap());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [(first.clone(), "e1"), (second.clone(), "e2")]
            .into_iter()
            .map(|(db, employee)| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    open_shift(&db, &LedgerPolicy::default(), &open_req(100, &[employee]))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "{results:?}");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(LedgerError::ShiftAlreadyOpen { .. }))));

        let active_a = get_active(&first, ShiftScope::Global, None).unwrap().unwrap();
        let active_b = get_active(&second, ShiftScope::Global, None).unwrap().unwrap();
        assert_eq!(active_a.id, active_b.id);

        drop(first);
        drop(second);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_per_employee_scope_allows_parallel_shifts() {
        let db = db::test_db();
        let policy = LedgerPolicy {
            scope: ShiftScope::PerEmployee,
            ..LedgerPolicy::default()
        };
        let a = open_shift(&db, &policy, &open_req(0, &["e1"])).unwrap();
        let b = open_shift(&db, &policy, &open_req(0, &["e2", "e3"])).unwrap();
        assert_eq!(a.scope_key, "e1");
        assert_eq!(b.scope_key, "e2");
        assert!(matches!(
            open_shift(&db, &policy, &open_req(0, &["e1"])),
            Err(LedgerError::ShiftAlreadyOpen { .. })
        ));
    }

    #[test]
    fn test_per_employee_crew_belongs_to_one_open_shift() {
        let db = db::test_db();
        let policy = LedgerPolicy {
            scope: ShiftScope::PerEmployee,
            ..LedgerPolicy::default()
        };
        let mut crew = open_req(0, &["e2", "e1"]);
        crew.opened_by = Some("e2".into());
        let shift = open_shift(&db, &policy, &crew).unwrap();
        assert_eq!(shift.scope_key, "e2");

        // e1 is on e2's crew, so cannot open a shift of their own
        let err = open_shift(&db, &policy, &open_req(0, &["e1"])).unwrap_err();
        match err {
            LedgerError::ShiftAlreadyOpen { existing_shift_id } => {
                assert_eq!(existing_shift_id.as_deref(), Some(shift.id.as_str()));
            }
            other => panic!("expected ShiftAlreadyOpen, got {other:?}"),
        }

        let active = get_active(&db, ShiftScope::PerEmployee, Some("e1")).unwrap().unwrap();
        assert_eq!(active.id, shift.id);
        let sale = sales::create_sale(
            &db,
            ShiftScope::PerEmployee,
            &SaleDetails {
                employee_id: "e1".into(),
                amount: units(12),
                payment_method: None,
                product: None,
                quantity: None,
                reference: None,
            },
        )
        .unwrap();
        assert_eq!(sale.shift_id, shift.id);

        let mut outsider = open_req(0, &["e3"]);
        outsider.opened_by = Some("e4".into());
        assert!(matches!(
            open_shift(&db, &policy, &outsider),
            Err(LedgerError::InvalidRequest(_))
        ));
        assert_eq!(
            list_shifts(&db, &ShiftFilter::default()).unwrap().len(),
            1,
            "rejected opens leave no shift behind"
        );
    }

    #[test]
    fn test_open_rejects_policy_that_differs_from_pinned_scope() {
        let db = db::test_db();
        let per_employee = LedgerPolicy {
            scope: ShiftScope::PerEmployee,
            ..LedgerPolicy::default()
        };
        crate::config::pin_scope(&db, ShiftScope::PerEmployee).unwrap();

        let err = open_shift(&db, &LedgerPolicy::default(), &open_req(0, &["e1"])).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
        assert!(get_active(&db, ShiftScope::Global, None).unwrap().is_none());

        open_shift(&db, &per_employee, &open_req(0, &["e1"])).unwrap();
    }

    #[test]
    fn test_short_drawer_close() {
        let db = db::test_db();
        let shift = open_shift(&db, &LedgerPolicy::default(), &open_req(10_000, &["e1"])).unwrap();
        sell(&db, "e1", 10_000);
        sell(&db, "e1", 8_000);
        sell(&db, "e1", 7_000);

        let closed = close_shift(&db, &close_req(&shift.id, 34_500, vec![])).unwrap();
        assert_eq!(closed.shift.status, ShiftStatus::Closed);
        assert_eq!(closed.shift.sales_total, units(25_000));
        assert_eq!(closed.shift.expected_cash, Some(units(35_000)));
        assert_eq!(closed.shift.variance, Some(units(-500)));
        assert_eq!(closed.reconciliation.sales_count, 3);
    }

    #[test]
    fn test_close_scenario_over_drawer() {
        let db = db::test_db();
        let shift = open_shift(&db, &LedgerPolicy::default(), &open_req(10_000, &["e1"])).unwrap();
        sell(&db, "e1", 12_000);
        sell(&db, "e1", 13_000);

        let breakdown = vec![PaymentEntry {
            method: PaymentMethod::Cash,
            amount: units(35_500),
            reference: None,
        }];
        let closed = close_shift(&db, &close_req(&shift.id, 35_500, breakdown.clone())).unwrap();
        assert_eq!(closed.shift.status, ShiftStatus::Closed);
        assert_eq!(closed.shift.sales_total, units(25_000));
        assert_eq!(closed.shift.variance, Some(units(500)));
        assert_eq!(closed.shift.payment_breakdown, breakdown);
        assert_eq!(closed.shift.closed_by.as_deref(), Some("e1"));
        assert!(closed.shift.closed_at.is_some());

        assert!(get_active(&db, ShiftScope::Global, None).unwrap().is_none());
        let keys = outbox_keys(&db);
        assert_eq!(keys.first().map(String::as_str), Some(format!("shift:open:{}", shift.id).as_str()));
        assert_eq!(keys.last().map(String::as_str), Some(format!("shift:close:{}", shift.id).as_str()));
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn test_close_is_terminal() {
        let db = db::test_db();
        let shift = open_shift(&db, &LedgerPolicy::default(), &open_req(100, &["e1"])).unwrap();
        close_shift(&db, &close_req(&shift.id, 100, vec![])).unwrap();

        let err = close_shift(&db, &close_req(&shift.id, 200, vec![])).unwrap_err();
        assert!(matches!(err, LedgerError::ShiftNotOpen(_)));

        let stored = get_shift(&db, &shift.id).unwrap().unwrap();
        assert_eq!(stored.closing_cash, Some(units(100)));
        assert_eq!(stored.variance, Some(Money::zero()));
    }

    #[test]
    fn test_close_rejects_bad_input_and_unknown_shift() {
        let db = db::test_db();
        assert!(matches!(
            close_shift(&db, &close_req("missing", 0, vec![])),
            Err(LedgerError::ShiftNotFound(_))
        ));

        let shift = open_shift(&db, &LedgerPolicy::default(), &open_req(100, &["e1"])).unwrap();
        let mut negative = close_req(&shift.id, 0, vec![]);
        negative.closing_cash = units(-5);
        assert!(matches!(
            close_shift(&db, &negative),
            Err(LedgerError::InvalidAmount { .. })
        ));

        let bad_line = close_req(
            &shift.id,
            100,
            vec![PaymentEntry {
                method: PaymentMethod::Card,
                amount: Money::from_minor(-1),
                reference: None,
            }],
        );
        assert!(matches!(
            close_shift(&db, &bad_line),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(get_shift(&db, &shift.id).unwrap().unwrap().is_open());
    }

    #[test]
    fn test_cash_tender_basis_is_stamped_at_open() {
        let db = db::test_db();
        let policy = LedgerPolicy {
            cash_basis: CashBasis::CashTender,
            ..LedgerPolicy::default()
        };
        let shift = open_shift(&db, &policy, &open_req(100, &["e1"])).unwrap();
        assert_eq!(shift.cash_basis, CashBasis::CashTender);

        for (amount, method) in [(50, PaymentMethod::Cash), (70, PaymentMethod::Card)] {
            sales::create_sale(
                &db,
                ShiftScope::Global,
                &SaleDetails {
                    employee_id: "e1".into(),
                    amount: units(amount),
                    payment_method: Some(method),
                    product: None,
                    quantity: None,
                    reference: None,
                },
            )
            .unwrap();
        }

        let closed = close_shift(&db, &close_req(&shift.id, 150, vec![])).unwrap();
        assert_eq!(closed.shift.sales_total, units(120));
        assert_eq!(closed.shift.expected_cash, Some(units(150)));
        assert_eq!(closed.shift.variance, Some(Money::zero()));
    }

    #[test]
    fn test_get_active_is_stable() {
        let db = db::test_db();
        assert!(get_active(&db, ShiftScope::Global, None).unwrap().is_none());
        assert!(get_active(&db, ShiftScope::Global, None).unwrap().is_none());

        let shift = open_shift(&db, &LedgerPolicy::default(), &open_req(0, &["e1"])).unwrap();
        let a = get_active(&db, ShiftScope::Global, None).unwrap().unwrap();
        let b = get_active(&db, ShiftScope::Global, None).unwrap().unwrap();
        assert_eq!(a.id, shift.id);
        assert_eq!(b.id, shift.id);
    }

    #[test]
    fn test_duplicate_request_is_rejected_and_findable() {
        let db = db::test_db();
        let policy = LedgerPolicy::default();
        let mut req = open_req(100, &["e1"]);
        req.client_request_id = Some("req-1".into());

        let shift = open_shift(&db, &policy, &req).unwrap();
        let found = find_by_request(&db, "req-1").unwrap().unwrap();
        assert_eq!(found.id, shift.id);
        assert!(find_by_request(&db, "req-2").unwrap().is_none());

        match open_shift(&db, &policy, &req).unwrap_err() {
            LedgerError::DuplicateRequest { request_id, shift_id } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(shift_id, shift.id);
            }
            other => panic!("expected DuplicateRequest, got {other:?}"),
        }

        // Still a duplicate after the shift is closed.
        close_shift(&db, &close_req(&shift.id, 100, vec![])).unwrap();
        assert!(matches!(
            open_shift(&db, &policy, &req),
            Err(LedgerError::DuplicateRequest { .. })
        ));
    }

    #[test]
    fn test_list_shifts_filters_and_orders() {
        let db = db::test_db();
        let policy = LedgerPolicy::default();
        let first = open_shift(&db, &policy, &open_req(0, &["e1"])).unwrap();
        close_shift(&db, &close_req(&first.id, 0, vec![])).unwrap();
        let second = open_shift(&db, &policy, &open_req(0, &["e2"])).unwrap();

        let all = list_shifts(&db, &ShiftFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);

        let closed = list_shifts(
            &db,
            &ShiftFilter {
                status: Some(ShiftStatus::Closed),
                ..ShiftFilter::default()
            },
        )
        .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, first.id);

        let by_employee = list_shifts(
            &db,
            &ShiftFilter {
                employee_id: Some("e2".into()),
                ..ShiftFilter::default()
            },
        )
        .unwrap();
        assert_eq!(by_employee.len(), 1);
        assert_eq!(by_employee[0].id, second.id);

        let limited = list_shifts(
            &db,
            &ShiftFilter {
                limit: Some(1),
                ..ShiftFilter::default()
            },
        )
        .unwrap();
        assert_eq!(limited.len(), 1);

        let future = list_shifts(
            &db,
            &ShiftFilter {
                opened_from: Some(Utc::now() + chrono::Duration::hours(1)),
                ..ShiftFilter::default()
            },
        )
        .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_summary_for_open_and_closed_shift() {
        let db = db::test_db();
        let shift = open_shift(&db, &LedgerPolicy::default(), &open_req(100, &["e1"])).unwrap();
        sell(&db, "e1", 40);

        let running = shift_summary(&db, &shift.id).unwrap();
        assert!(running.provisional);
        assert_eq!(running.reconciliation.expected_cash, units(140));
        assert!(running.reconciliation.variance.is_none());

        close_shift(&db, &close_req(&shift.id, 130, vec![])).unwrap();
        let report = shift_summary(&db, &shift.id).unwrap();
        assert!(!report.provisional);
        assert_eq!(report.reconciliation.variance, Some(units(-10)));
        assert_eq!(report.reconciliation.sales_count, 1);

        assert!(matches!(
            shift_summary(&db, "missing"),
            Err(LedgerError::ShiftNotFound(_))
        ));
    }
}
