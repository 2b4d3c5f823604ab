use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{object_only, parse_payload, payload_object, required_id};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::ShiftLedger;
use crate::models::SaleDetails;
use crate::money::parse_amount;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleCreatePayload {
    #[serde(default, alias = "employee_id", alias = "staffId", alias = "staff_id")]
    employee_id: String,
    #[serde(default, alias = "total", alias = "totalAmount", alias = "total_amount")]
    amount: Value,
    #[serde(default, alias = "payment_method")]
    payment_method: Option<String>,
    #[serde(default, alias = "fuelType", alias = "fuel_type")]
    product: Option<String>,
    #[serde(default, alias = "liters", alias = "volume")]
    quantity: Option<Value>,
    #[serde(default, alias = "receiptNumber", alias = "receipt_number")]
    reference: Option<String>,
    /// Present only to reject it: attribution is the ledger's job.
    #[serde(default, alias = "shift_id")]
    shift_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleListPayload {
    #[serde(default, alias = "shift_id", alias = "id")]
    shift_id: String,
}

fn parse_sale_payload(payload: Option<Value>) -> LedgerResult<SaleDetails> {
    let parsed: SaleCreatePayload = parse_payload(object_only(payload, "sale")?, "sale")?;
    if parsed.shift_id.is_some() {
        return Err(LedgerError::InvalidRequest(
            "sales are attributed to the open shift automatically; do not send shiftId".into(),
        ));
    }

    Ok(SaleDetails {
        employee_id: parsed.employee_id,
        amount: parse_amount(&parsed.amount, "amount")?,
        payment_method: parsed
            .payment_method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::parse)
            .transpose()?,
        product: non_blank(parsed.product),
        quantity: parsed.quantity.as_ref().map(parse_quantity).transpose()?.flatten(),
        reference: non_blank(parsed.reference),
    })
}

fn parse_quantity(value: &Value) -> LedgerResult<Option<Decimal>> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => Decimal::from_str(&n.to_string()),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => Decimal::from_str(s.trim()),
        _ => {
            return Err(LedgerError::InvalidRequest(
                "quantity must be a number or a decimal string".into(),
            ))
        }
    };
    parsed
        .map(Some)
        .map_err(|e| LedgerError::InvalidRequest(format!("invalid quantity: {e}")))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub async fn sale_create(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let details = parse_sale_payload(payload)?;
    let sale = ledger.create_sale(details).await?;
    Ok(json!({ "success": true, "sale": sale }))
}

pub async fn sale_list(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let parsed: SaleListPayload = parse_payload(payload_object(payload, "shiftId"), "sale list")?;
    let shift_id = required_id(parsed.shift_id, "shiftId")?;
    let sales = ledger.list_sales(shift_id).await?;
    Ok(json!({ "success": true, "sales": sales }))
}
