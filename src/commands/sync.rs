use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, payload_object};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::ShiftLedger;

const DEFAULT_PENDING_LIMIT: u32 = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPendingPayload {
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncEntryPayload {
    #[serde(alias = "queue_id", alias = "queueId")]
    id: Value,
    #[serde(default, alias = "last_error", alias = "message")]
    error: Option<String>,
}

/// Queue ids arrive as numbers or numeric strings.
fn parse_entry_id(value: &Value) -> LedgerResult<i64> {
    let id = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    id.ok_or_else(|| LedgerError::InvalidRequest(format!("invalid sync entry id {value}")))
}

fn parse_entry_payload(payload: Option<Value>) -> LedgerResult<(i64, Option<String>)> {
    let payload = match payload {
        Some(Value::Number(n)) => json!({ "id": n }),
        other => payload_object(other, "id"),
    };
    let parsed: SyncEntryPayload = parse_payload(payload, "sync entry")?;
    Ok((parse_entry_id(&parsed.id)?, parsed.error))
}

pub async fn sync_pending(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let parsed: SyncPendingPayload = match payload {
        Some(Value::Number(n)) => SyncPendingPayload {
            limit: n.as_u64().and_then(|l| u32::try_from(l).ok()),
        },
        other => parse_payload(payload_object(other, "limit"), "sync pending")?,
    };
    let entries = ledger
        .sync_pending(parsed.limit.unwrap_or(DEFAULT_PENDING_LIMIT))
        .await?;
    Ok(json!({ "success": true, "entries": entries }))
}

pub async fn sync_mark_synced(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let (id, _) = parse_entry_payload(payload)?;
    ledger.sync_mark_synced(id).await?;
    Ok(json!({ "success": true, "id": id, "status": "synced" }))
}

pub async fn sync_mark_failed(ledger: &ShiftLedger, payload: Option<Value>) -> LedgerResult<Value> {
    let (id, error) = parse_entry_payload(payload)?;
    let error = error
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| "unspecified forwarding error".to_string());
    let status = ledger.sync_mark_failed(id, error).await?;
    Ok(json!({ "success": true, "id": id, "status": status }))
}

pub async fn sync_backlog(ledger: &ShiftLedger) -> LedgerResult<Value> {
    let backlog = ledger.sync_backlog().await?;
    Ok(json!({ "success": true, "backlog": backlog }))
}
