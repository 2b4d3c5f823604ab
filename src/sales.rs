//! Sale recording with shift attribution.
//!
//! A sale never names its shift. The recorder resolves the open shift for the
//! acting employee (the global shift, or under per-employee scope the open
//! shift whose crew lists them) and stamps it in the same write transaction,
//! so a sale can never be orphaned or attached to a closed shift.

use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ensure_pinned_scope;
use crate::db::{format_ts, parse_ts, with_immediate_tx, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{PaymentMethod, Sale, SaleDetails, ShiftScope};
use crate::money::Money;
use crate::reconcile::{MethodTotal, SalesTally};
use crate::shifts;
use crate::sync;

/// Record a sale against the currently open shift.
pub fn create_sale(db: &DbState, scope: ShiftScope, details: &SaleDetails) -> LedgerResult<Sale> {
    let employee_id = details.employee_id.trim().to_string();
    if employee_id.is_empty() {
        return Err(LedgerError::InvalidEmployeeId(details.employee_id.clone()));
    }
    let amount = details.amount.non_negative("amount")?;
    let amount_minor = amount.to_minor()?;
    if let Some(quantity) = details.quantity {
        if quantity.is_sign_negative() && !quantity.is_zero() {
            return Err(LedgerError::InvalidRequest(
                "quantity must not be negative".into(),
            ));
        }
    }

    let sale_id = Uuid::new_v4().to_string();
    let created_at = Utc::now();
    let created_at_s = format_ts(created_at);

    let conn = db.lock()?;
    let result = with_immediate_tx(&conn, |conn| {
        ensure_pinned_scope(conn, scope)?;
        let shift_id = shifts::open_shift_id_for(conn, scope, Some(employee_id.as_str()))?
            .ok_or(LedgerError::NoActiveShift)?;

        conn.execute(
            "INSERT INTO sales (
                id, shift_id, employee_id, amount_minor, payment_method,
                product, quantity, reference, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                sale_id,
                shift_id,
                employee_id,
                amount_minor,
                details.payment_method.map(PaymentMethod::as_str),
                details.product,
                details.quantity.map(|q| q.to_string()),
                details.reference,
                created_at_s,
            ],
        )?;

        sync::enqueue(
            conn,
            "sale",
            &sale_id,
            "create",
            &serde_json::json!({
                "saleId": sale_id,
                "shiftId": shift_id,
                "employeeId": employee_id,
                "amount": amount,
                "paymentMethod": details.payment_method,
                "product": details.product,
                "quantity": details.quantity,
                "reference": details.reference,
                "createdAt": created_at_s,
            }),
        )?;

        Ok(shift_id)
    });

    let shift_id = match result {
        Ok(shift_id) => shift_id,
        Err(e) => {
            warn!(employee_id = %employee_id, error = %e, "Sale rejected");
            return Err(e);
        }
    };

    info!(sale_id = %sale_id, shift_id = %shift_id, amount = %amount, "Sale recorded");

    Ok(Sale {
        id: sale_id,
        shift_id,
        employee_id,
        amount,
        payment_method: details.payment_method,
        product: details.product.clone(),
        quantity: details.quantity,
        reference: details.reference.clone(),
        created_at,
    })
}

/// Sales attributed to a shift, oldest first.
pub fn list_sales(db: &DbState, shift_id: &str) -> LedgerResult<Vec<Sale>> {
    let conn = db.lock()?;

    let exists: Option<String> = conn
        .query_row(
            "SELECT status FROM shifts WHERE id = ?1",
            params![shift_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(LedgerError::ShiftNotFound(shift_id.to_string()));
    }

    let mut stmt = conn.prepare(
        "SELECT id, shift_id, employee_id, amount_minor, payment_method,
                product, quantity, reference, created_at
         FROM sales
         WHERE shift_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;

    let rows = stmt.query_map(params![shift_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, String>(8)?,
        ))
    })?;

    let mut sales = Vec::new();
    for row in rows {
        let (id, shift_id, employee_id, amount_minor, method, product, quantity, reference, created_at) =
            row?;
        sales.push(Sale {
            id,
            shift_id,
            employee_id,
            amount: Money::from_minor(amount_minor),
            payment_method: method.as_deref().map(stored_method).transpose()?,
            product,
            quantity: quantity
                .as_deref()
                .map(|q| {
                    Decimal::from_str(q)
                        .map_err(|e| LedgerError::Storage(format!("bad stored quantity {q:?}: {e}")))
                })
                .transpose()?,
            reference,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(sales)
}

/// Live aggregate of a shift's sales, grouped by tender.
///
/// Call inside the caller's transaction when the result must be consistent
/// with a subsequent write.
pub fn tally_for_shift(conn: &Connection, shift_id: &str) -> LedgerResult<SalesTally> {
    let mut stmt = conn.prepare(
        "SELECT payment_method, COUNT(*), COALESCE(SUM(amount_minor), 0)
         FROM sales
         WHERE shift_id = ?1
         GROUP BY payment_method",
    )?;
    let rows = stmt.query_map(params![shift_id], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut by_method = Vec::new();
    for row in rows {
        let (method, count, amount_minor) = row?;
        by_method.push(MethodTotal {
            method: method.as_deref().map(stored_method).transpose()?,
            count,
            amount: Money::from_minor(amount_minor),
        });
    }
    // Known tenders in declaration order, unrecorded tender last.
    by_method.sort_by_key(|m| (m.method.is_none(), m.method));

    Ok(SalesTally::from_method_totals(by_method))
}

fn stored_method(raw: &str) -> LedgerResult<PaymentMethod> {
    PaymentMethod::from_str(raw)
        .map_err(|_| LedgerError::Storage(format!("bad stored payment method {raw:?}")))
}
