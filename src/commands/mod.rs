//! JSON command surface.
//!
//! Each request line is `{"command": ..., "payload": ..., "id": ...}` and each
//! response line echoes `id` with either `"success": true` plus data, or
//! `"success": false` with a stable `errorCode`, an operator message and
//! whether a retry is safe.

pub mod diagnostics;
pub mod sales;
pub mod shifts;
pub mod sync;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::ShiftLedger;

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
}

/// Route one command to its handler.
pub async fn dispatch(
    ledger: &ShiftLedger,
    command: &str,
    payload: Option<Value>,
) -> LedgerResult<Value> {
    match command {
        "shift_open" => shifts::shift_open(ledger, payload).await,
        "shift_close" => shifts::shift_close(ledger, payload).await,
        "shift_get_active" => shifts::shift_get_active(ledger, payload).await,
        "shift_get" => shifts::shift_get(ledger, payload).await,
        "shift_list" => shifts::shift_list(ledger, payload).await,
        "shift_summary" => shifts::shift_summary(ledger, payload).await,
        "shift_find_by_request" => shifts::shift_find_by_request(ledger, payload).await,
        "sale_create" => sales::sale_create(ledger, payload).await,
        "sale_list" => sales::sale_list(ledger, payload).await,
        "sync_pending" => sync::sync_pending(ledger, payload).await,
        "sync_mark_synced" => sync::sync_mark_synced(ledger, payload).await,
        "sync_mark_failed" => sync::sync_mark_failed(ledger, payload).await,
        "sync_backlog" => sync::sync_backlog(ledger).await,
        "diagnostics_health" => diagnostics::diagnostics_health(ledger).await,
        other => Err(LedgerError::InvalidRequest(format!(
            "unknown command {other:?}"
        ))),
    }
}

/// Handle one request line. Blank lines yield no response.
pub async fn handle_line(ledger: &ShiftLedger, line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let request: CommandRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            let err = LedgerError::InvalidRequest(format!("malformed request line: {e}"));
            warn!(error = %e, "Rejected malformed request line");
            return Some(with_id(error_response(&err), None));
        }
    };

    debug!(command = %request.command, "Dispatching command");
    let response = match dispatch(ledger, &request.command, request.payload).await {
        Ok(body) => body,
        Err(err) => {
            if err.is_domain() {
                debug!(command = %request.command, code = err.code(), "Command rejected");
            } else {
                warn!(command = %request.command, error = %err, "Command failed");
            }
            error_response(&err)
        }
    };
    Some(with_id(response, request.id))
}

/// Failure body for the command surface.
pub fn error_response(err: &LedgerError) -> Value {
    let mut body = json!({
        "success": false,
        "errorCode": err.code(),
        "message": err.user_message(),
        "detail": err.to_string(),
        "retryable": err.is_retryable(),
    });
    match err {
        LedgerError::ShiftAlreadyOpen { existing_shift_id } => {
            body["existingShiftId"] = json!(existing_shift_id);
        }
        LedgerError::DuplicateRequest { shift_id, .. } => {
            body["shiftId"] = json!(shift_id);
        }
        _ => {}
    }
    body
}

fn with_id(mut body: Value, id: Option<Value>) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert("id".into(), id.unwrap_or(Value::Null));
    }
    body
}

/// Accept either an object payload or a bare string standing for `key`.
pub(crate) fn payload_object(payload: Option<Value>, key: &str) -> Value {
    match payload {
        Some(Value::String(s)) => json!({ key: s }),
        Some(Value::Null) | None => json!({}),
        Some(v) => v,
    }
}

/// Payload for commands that need more than an id: only an object will do.
pub(crate) fn object_only(payload: Option<Value>, what: &str) -> LedgerResult<Value> {
    match payload {
        Some(Value::Object(map)) => Ok(Value::Object(map)),
        Some(Value::Null) | None => Ok(json!({})),
        Some(_) => Err(LedgerError::InvalidRequest(format!(
            "{what} payload must be an object"
        ))),
    }
}

pub(crate) fn parse_payload<T: DeserializeOwned>(payload: Value, what: &str) -> LedgerResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| LedgerError::InvalidRequest(format!("invalid {what} payload: {e}")))
}

pub(crate) fn required_id(value: String, name: &str) -> LedgerResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidRequest(format!("missing {name}")));
    }
    Ok(trimmed.to_string())
}
