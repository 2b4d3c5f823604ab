//! Diagnostics for the station ledger.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Ledger health**: schema version, open shifts, outbox backlog and the
//!   most recent forwarding errors
//! - **Log rotation helpers**: used by `lib.rs` before the rolling appender
//!   starts.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::LedgerResult;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix used by the rolling appender.
pub const LOG_FILE_PREFIX: &str = "ledger";

const RECENT_SYNC_ERRORS: i64 = 20;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Ledger health
// ---------------------------------------------------------------------------

/// Snapshot of the ledger's state for the health screen.
pub fn system_health(db: &DbState) -> LedgerResult<Value> {
    let conn = db.lock()?;

    let schema_version = db::schema_version(&conn)?;
    let shift_scope = db::get_setting(&conn, "ledger", "shift_scope")?;
    let open_shifts = open_shifts(&conn)?;
    let sync_backlog = sync_counts(&conn)?;
    let last_synced_at: Option<String> = conn.query_row(
        "SELECT MAX(synced_at) FROM sync_queue WHERE status = 'synced'",
        [],
        |row| row.get(0),
    )?;
    let recent_errors = recent_sync_errors(&conn, RECENT_SYNC_ERRORS)?;
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "about": about_info(),
        "schemaVersion": schema_version,
        "shiftScope": shift_scope,
        "openShifts": open_shifts,
        "syncBacklog": sync_backlog,
        "lastSyncedAt": last_synced_at,
        "recentSyncErrors": recent_errors,
        "dbPath": db.db_path.display().to_string(),
        "dbSizeBytes": db_size,
    }))
}

fn open_shifts(conn: &Connection) -> LedgerResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, scope_key, opened_at FROM shifts
         WHERE status = 'open' ORDER BY opened_at ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "scopeKey": row.get::<_, String>(1)?,
            "openedAt": row.get::<_, String>(2)?,
        }))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn sync_counts(conn: &Connection) -> LedgerResult<Value> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, status, COUNT(*) FROM sync_queue GROUP BY entity_type, status",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut by_entity = serde_json::Map::new();
    for row in rows {
        let (entity_type, status, count) = row?;
        let entry = by_entity
            .entry(entity_type)
            .or_insert_with(|| json!({ "pending": 0, "failed": 0, "synced": 0 }));
        entry[status.as_str()] = json!(count);
    }
    Ok(Value::Object(by_entity))
}

fn recent_sync_errors(conn: &Connection, limit: i64) -> LedgerResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, operation, status, retry_count, last_error, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL
         ORDER BY updated_at DESC, id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(json!({
            "id": row.get::<_, i64>(0)?,
            "entityType": row.get::<_, String>(1)?,
            "entityId": row.get::<_, String>(2)?,
            "operation": row.get::<_, String>(3)?,
            "status": row.get::<_, String>(4)?,
            "retryCount": row.get::<_, i64>(5)?,
            "lastError": row.get::<_, Option<String>>(6)?,
            "updatedAt": row.get::<_, Option<String>>(7)?,
        }))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; ties broken by name so dated files stay ordered.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
