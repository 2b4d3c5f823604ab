use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{object_only, parse_payload, payload_object, required_id};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::ShiftLedger;
use crate::models::{CloseShiftRequest, OpenShiftRequest, PaymentEntry, ShiftFilter};
use crate::money::parse_amount;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenShiftPayload {
    #[serde(default, alias = "opening_cash", alias = "startingAmount", alias = "starting_amount")]
    opening_cash: Value,
    #[serde(default, alias = "employee_ids", alias = "employees")]
    employee_ids: Vec<String>,
    #[serde(default, alias = "opened_by", alias = "staffId", alias = "staff_id")]
    opened_by: Option<String>,
    #[serde(default, alias = "client_request_id", alias = "requestId", alias = "request_id")]
    client_request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentEntryPayload {
    method: String,
    #[serde(default)]
    amount: Value,
    #[serde(default)]
    reference: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseShiftPayload {
    #[serde(default, alias = "shift_id", alias = "id")]
    shift_id: String,
    #[serde(default, alias = "closing_cash", alias = "closingAmount", alias = "closing_amount")]
    closing_cash: Value,
    #[serde(default, alias = "payment_breakdown", alias = "breakdown", alias = "payments")]
    payment_breakdown: Vec<PaymentEntryPayload>,
    #[serde(default, alias = "closed_by", alias = "staffId", alias = "staff_id")]
    closed_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveShiftPayload {
    #[serde(default, alias = "employee_id", alias = "staffId", alias = "staff_id")]
    employee_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShiftIdPayload {
    #[serde(default, alias = "shift_id", alias = "id")]
    shift_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShiftRequestPayload {
    #[serde(default, alias = "client_request_id", alias = "requestId", alias = "request_id")]
    client_request_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShiftListPayload {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "opened_from", alias = "dateFrom", alias = "date_from")]
    opened_from: Option<String>,
    #[serde(default, alias = "opened_to", alias = "dateTo", alias = "date_to")]
    opened_to: Option<String>,
    #[serde(default, alias = "employee_id", alias = "staffId", alias = "staff_id")]
    employee_id: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

fn parse_open_payload(payload: Option<Value>) -> LedgerResult<OpenShiftRequest> {
    let parsed: OpenShiftPayload = parse_payload(object_only(payload, "shift open")?, "shift open")?;
    Ok(OpenShiftRequest {
        opening_cash: parse_amount(&parsed.opening_cash, "opening_cash")?,
        employee_ids: parsed.employee_ids,
        opened_by: parsed.opened_by,
        client_request_id: parsed.client_request_id,
    })
}

fn parse_close_payload(payload: Option<Value>) -> LedgerResult<CloseShiftRequest> {
    let parsed: CloseShiftPayload = parse_payload(object_only(payload, "shift close")?, "shift close")?;
    let mut payment_breakdown = Vec::with_capacity(parsed.payment_breakdown.len());
    for (i, entry) in parsed.payment_breakdown.into_iter().enumerate() {
        payment_breakdown.push(PaymentEntry {
            method: entry.method.parse()?,
            amount: parse_amount(&entry.amount, &format!("payment_breakdown[{i}].amount"))?,
            reference: entry.reference.filter(|r| !r.trim().is_empty()),
        });
    }
    Ok(CloseShiftRequest {
        shift_id: required_id(parsed.shift_id, "shiftId")?,
        closing_cash: parse_amount(&parsed.closing_cash, "closing_cash")?,
        payment_breakdown,
        closed_by: parsed.closed_by,
    })
}

fn parse_list_payload(payload: Option<Value>) -> LedgerResult<ShiftFilter> {
    let parsed: ShiftListPayload = parse_payload(payload_object(payload, "status"), "shift list")?;
    Ok(ShiftFilter {
        status: parsed.status.as_deref().map(str::parse).transpose()?,
        opened_from: parse_time(parsed.opened_from.as_deref(), "openedFrom")?,
        opened_to: parse_time(parsed.opened_to.as_deref(), "openedTo")?,
        employee_id: parsed.employee_id,
        limit: parsed.limit,
    })
}

fn parse_time(raw: Option<&str>, name: &str) -> LedgerResult<Option<DateTime<Utc>>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| LedgerError::InvalidRequest(format!("{name} must be RFC 3339: {e}"))),
    }
}

fn parse_shift_id(payload: Option<Value>) -> LedgerResult<String> {
    let parsed: ShiftIdPayload = parse_payload(payload_object(payload, "shiftId"), "shift id")?;
    required_id(parsed.shift_id, "shiftId")
}

pub async fn shift_open(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let req = parse_open_payload(payload)?;
    let shift = ledger.open_shift(req).await?;
    Ok(json!({ "success": true, "shift": shift }))
}

pub async fn shift_close(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let req = parse_close_payload(payload)?;
    let closed = ledger.close_shift(req).await?;
    Ok(json!({
        "success": true,
        "shift": closed.shift,
        "expectedCash": closed.reconciliation.expected_cash,
        "variance": closed.reconciliation.variance,
        "reconciliation": closed.reconciliation,
    }))
}

pub async fn shift_get_active(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let parsed: ActiveShiftPayload =
        parse_payload(payload_object(payload, "employeeId"), "active shift")?;
    let shift = ledger.active_shift(parsed.employee_id).await?;
    Ok(json!({ "success": true, "shift": shift }))
}

pub async fn shift_get(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let shift_id = parse_shift_id(payload)?;
    let shift = ledger.shift(shift_id).await?;
    Ok(json!({ "success": true, "shift": shift }))
}

pub async fn shift_list(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let filter = parse_list_payload(payload)?;
    let shifts = ledger.list_shifts(filter).await?;
    Ok(json!({ "success": true, "shifts": shifts }))
}

pub async fn shift_summary(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let shift_id = parse_shift_id(payload)?;
    let summary = ledger.shift_summary(shift_id).await?;
    Ok(json!({ "success": true, "summary": summary }))
}

pub async fn shift_find_by_request(
    ledger: &ShiftLedger,
    payload: Option<Value>,
) -> LedgerResult<Value> {
    let parsed: ShiftRequestPayload =
        parse_payload(payload_object(payload, "clientRequestId"), "shift request")?;
    let request_id = required_id(parsed.client_request_id, "clientRequestId")?;
    let shift = ledger.find_shift_by_request(request_id).await?;
    Ok(json!({ "success": true, "shift": shift }))
}
