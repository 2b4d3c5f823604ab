//! Outbox of ledger mutations awaiting replication to the hosted backend.
//!
//! Rows are written inside the same transaction as the mutation they describe,
//! keyed by a unique idempotency key, so the outbox never disagrees with the
//! ledger. A forwarder drains `pending` rows and acknowledges them.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::db::{format_ts, DbState};
use crate::error::{LedgerError, LedgerResult};

const BASE_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 15 * 60 * 1000;
const MAX_PENDING_BATCH: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: Value,
    pub idempotency_key: String,
    pub status: String,
    pub retry_count: i64,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBacklog {
    pub pending: i64,
    pub failed: i64,
    pub synced: i64,
}

/// Append an outbox row. Call from inside the mutation's transaction.
pub fn enqueue(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    operation: &str,
    payload: &Value,
) -> LedgerResult<()> {
    let idempotency_key = format!("{entity_type}:{operation}:{entity_id}");
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entity_type,
            entity_id,
            operation,
            payload.to_string(),
            idempotency_key
        ],
    )?;
    Ok(())
}

/// Rows ready to forward, oldest first.
pub fn pending(db: &DbState, limit: u32) -> LedgerResult<Vec<SyncEntry>> {
    let conn = db.lock()?;
    let limit = limit.clamp(1, MAX_PENDING_BATCH);
    let now = format_ts(Utc::now());

    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, operation, payload, idempotency_key,
                status, retry_count, next_retry_at, last_error, created_at
         FROM sync_queue
         WHERE status = 'pending'
           AND (next_retry_at IS NULL OR next_retry_at <= ?1)
         ORDER BY id ASC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![now, limit], |row| {
        let raw_payload: String = row.get(4)?;
        Ok(SyncEntry {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            operation: row.get(3)?,
            payload: serde_json::from_str(&raw_payload).unwrap_or(Value::String(raw_payload)),
            idempotency_key: row.get(5)?,
            status: row.get(6)?,
            retry_count: row.get(7)?,
            next_retry_at: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

pub fn mark_synced(db: &DbState, id: i64) -> LedgerResult<()> {
    let conn = db.lock()?;
    let now = format_ts(Utc::now());
    let changed = conn.execute(
        "UPDATE sync_queue SET status = 'synced', synced_at = ?1, updated_at = ?1,
                last_error = NULL, next_retry_at = NULL
         WHERE id = ?2",
        params![now, id],
    )?;
    if changed == 0 {
        return Err(LedgerError::InvalidRequest(format!(
            "sync entry {id} does not exist"
        )));
    }
    info!(queue_id = id, "Sync entry acknowledged");
    Ok(())
}

/// Record a forwarding failure and schedule the next attempt. Returns the new
/// status (`pending` or `failed` once retries are exhausted).
pub fn mark_failed(db: &DbState, id: i64, error: &str) -> LedgerResult<String> {
    let conn = db.lock()?;

    let (retry_count, max_retries): (i64, i64) = conn
        .query_row(
            "SELECT retry_count, max_retries FROM sync_queue WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| LedgerError::InvalidRequest(format!("sync entry {id} does not exist")))?;

    let attempts = retry_count + 1;
    let now = format_ts(Utc::now());

    if attempts >= max_retries {
        conn.execute(
            "UPDATE sync_queue SET status = 'failed', retry_count = ?1, last_error = ?2,
                    next_retry_at = NULL, updated_at = ?3
             WHERE id = ?4",
            params![attempts, error, now, id],
        )?;
        warn!(queue_id = id, attempts, error = %error, "Sync entry failed permanently");
        return Ok("failed".into());
    }

    let next_retry_at = schedule_next_retry(retry_delay_ms(attempts), id);
    conn.execute(
        "UPDATE sync_queue SET retry_count = ?1, last_error = ?2, next_retry_at = ?3,
                updated_at = ?4
         WHERE id = ?5",
        params![attempts, error, next_retry_at, now, id],
    )?;
    warn!(
        queue_id = id,
        attempts,
        next_retry_at = %next_retry_at,
        error = %error,
        "Sync entry failed, retry scheduled"
    );
    Ok("pending".into())
}

pub fn backlog(db: &DbState) -> LedgerResult<SyncBacklog> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut backlog = SyncBacklog::default();
    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "pending" => backlog.pending = count,
            "failed" => backlog.failed = count,
            "synced" => backlog.synced = count,
            _ => {}
        }
    }
    Ok(backlog)
}

/// Exponential backoff: 5s, 10s, 20s, ... capped at 15 minutes.
fn retry_delay_ms(attempts: i64) -> i64 {
    let exponent = (attempts - 1).clamp(0, 20) as u32;
    BASE_RETRY_DELAY_MS
        .saturating_mul(2_i64.saturating_pow(exponent))
        .min(MAX_RETRY_DELAY_MS)
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    format_ts(Utc::now() + ChronoDuration::milliseconds(bounded + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn enqueue_sample(db: &DbState, entity_id: &str) {
        let conn = db.lock().unwrap();
        enqueue(
            &conn,
            "shift",
            entity_id,
            "open",
            &serde_json::json!({ "shiftId": entity_id }),
        )
        .unwrap();
    }

    #[test]
    fn test_enqueue_is_idempotent_per_key() {
        let db = db::test_db();
        enqueue_sample(&db, "s-1");
        let conn = db.lock().unwrap();
        let dup = enqueue(&conn, "shift", "s-1", "open", &serde_json::json!({}));
        assert!(dup.is_err(), "same idempotency key must be rejected");
    }

    #[test]
    fn test_pending_then_synced() {
        let db = db::test_db();
        enqueue_sample(&db, "s-1");
        enqueue_sample(&db, "s-2");

        let entries = pending(&db, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].idempotency_key, "shift:open:s-1");
        assert_eq!(entries[0].payload["shiftId"], "s-1");

        mark_synced(&db, entries[0].id).unwrap();
        let remaining = pending(&db, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity_id, "s-2");

        let b = backlog(&db).unwrap();
        assert_eq!(b.pending, 1);
        assert_eq!(b.synced, 1);
    }

    #[test]
    fn test_failure_schedules_retry_then_gives_up() {
        let db = db::test_db();
        enqueue_sample(&db, "s-1");
        let id = pending(&db, 1).unwrap()[0].id;

        assert_eq!(mark_failed(&db, id, "backend unavailable").unwrap(), "pending");
        // Scheduled in the future, so not ready right now.
        assert!(pending(&db, 10).unwrap().is_empty());

        for _ in 0..3 {
            assert_eq!(mark_failed(&db, id, "backend unavailable").unwrap(), "pending");
        }
        assert_eq!(mark_failed(&db, id, "backend unavailable").unwrap(), "failed");
        assert_eq!(backlog(&db).unwrap().failed, 1);
    }

    #[test]
    fn test_unknown_entry_rejected() {
        let db = db::test_db();
        assert!(matches!(
            mark_synced(&db, 999),
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(mark_failed(&db, 999, "x").is_err());
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        assert_eq!(retry_delay_ms(1), 5_000);
        assert_eq!(retry_delay_ms(2), 10_000);
        assert_eq!(retry_delay_ms(3), 20_000);
        assert_eq!(retry_delay_ms(30), MAX_RETRY_DELAY_MS);
    }
}
