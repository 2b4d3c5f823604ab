//! Local SQLite persistence for the shift ledger.
//!
//! Uses rusqlite with WAL mode. The schema itself carries the ledger's hard
//! invariants: a partial unique index allows one open shift per scope key, and
//! triggers freeze closed shifts together with their sales and breakdown.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info};

use crate::error::{LedgerError, LedgerResult};

/// Shared database handle. Each handle owns one connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Storage(format!("connection mutex poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

pub const DB_FILE_NAME: &str = "ledger.db";

/// Open (or create) the ledger database at `{data_dir}/ledger.db` and run any
/// pending migrations.
///
/// Unlike a cache, the ledger is the system of record: an open failure is
/// returned to the caller instead of recreating the file.
pub fn init(data_dir: &Path, busy_timeout: Duration) -> LedgerResult<DbState> {
    fs::create_dir_all(data_dir).map_err(|e| {
        LedgerError::Storage(format!(
            "failed to create data dir {}: {e}",
            data_dir.display()
        ))
    })?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening ledger database at {}", db_path.display());

    let conn = open_and_configure(&db_path, busy_timeout)?;
    run_migrations(&conn)?;

    info!("Ledger database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path, busy_timeout: Duration) -> LedgerResult<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| LedgerError::Storage(format!("sqlite open {}: {e}", path.display())))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| LedgerError::Storage(format!("pragma setup: {e}")))?;
    conn.busy_timeout(busy_timeout)?;

    Ok(conn)
}

/// In-memory database with the full schema. Used by tests and tooling.
pub fn open_in_memory() -> LedgerResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| LedgerError::Storage(format!("create schema_version: {e}")))?;

    let current = schema_version(conn)?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Ledger schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating ledger database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> LedgerResult<i32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

fn migration_error(version: i32, e: rusqlite::Error) -> LedgerError {
    error!("Migration v{version} failed: {e}");
    LedgerError::Storage(format!("migration v{version}: {e}"))
}

/// Migration v1: settings store and the sync outbox.
fn migrate_v1(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- sync_queue (append-only outbox towards the hosted backend)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status_next_retry
            ON sync_queue(status, next_retry_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| migration_error(1, e))?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: shifts, attributed sales, and the close breakdown.
fn migrate_v2(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS shifts (
            id TEXT PRIMARY KEY,
            scope_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            opening_minor INTEGER NOT NULL CHECK (opening_minor >= 0),
            closing_minor INTEGER CHECK (closing_minor IS NULL OR closing_minor >= 0),
            expected_minor INTEGER,
            variance_minor INTEGER,
            cash_basis TEXT NOT NULL DEFAULT 'all_sales'
                CHECK (cash_basis IN ('all_sales', 'cash_tender')),
            opened_by TEXT,
            closed_by TEXT,
            client_request_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (
                (status = 'open' AND closed_at IS NULL AND closing_minor IS NULL)
                OR (status = 'closed' AND closed_at IS NOT NULL AND closing_minor IS NOT NULL)
            )
        );

        -- At most one open shift per scope key.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_shifts_one_open_per_scope
            ON shifts(scope_key) WHERE status = 'open';
        CREATE INDEX IF NOT EXISTS idx_shifts_status ON shifts(status);
        CREATE INDEX IF NOT EXISTS idx_shifts_opened_at ON shifts(opened_at);

        CREATE TABLE IF NOT EXISTS shift_employees (
            shift_id TEXT NOT NULL,
            employee_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (shift_id, employee_id),
            FOREIGN KEY(shift_id) REFERENCES shifts(id)
        );
        CREATE INDEX IF NOT EXISTS idx_shift_employees_employee
            ON shift_employees(employee_id);

        CREATE TABLE IF NOT EXISTS shift_payments (
            shift_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            method TEXT NOT NULL
                CHECK (method IN ('cash', 'card', 'bank_transfer', 'credit', 'voucher')),
            amount_minor INTEGER NOT NULL CHECK (amount_minor >= 0),
            reference TEXT,
            PRIMARY KEY (shift_id, position),
            FOREIGN KEY(shift_id) REFERENCES shifts(id)
        );

        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            shift_id TEXT NOT NULL,
            employee_id TEXT NOT NULL,
            amount_minor INTEGER NOT NULL CHECK (amount_minor >= 0),
            payment_method TEXT
                CHECK (payment_method IS NULL
                       OR payment_method IN ('cash', 'card', 'bank_transfer', 'credit', 'voucher')),
            product TEXT,
            quantity TEXT,
            reference TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(shift_id) REFERENCES shifts(id)
        );
        CREATE INDEX IF NOT EXISTS idx_sales_shift_id ON sales(shift_id);
        CREATE INDEX IF NOT EXISTS idx_sales_created_at ON sales(created_at);

        -- Closed shifts are terminal and shifts are never deleted.
        CREATE TRIGGER IF NOT EXISTS trg_shifts_closed_immutable
        BEFORE UPDATE ON shifts
        WHEN OLD.status = 'closed'
        BEGIN
            SELECT RAISE(ABORT, 'shift is closed');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_shifts_no_delete
        BEFORE DELETE ON shifts
        BEGIN
            SELECT RAISE(ABORT, 'shifts cannot be deleted');
        END;

        -- Sales, crew and breakdown rows may only change while the shift is open.
        CREATE TRIGGER IF NOT EXISTS trg_sales_require_open_shift
        BEFORE INSERT ON sales
        WHEN (SELECT status FROM shifts WHERE id = NEW.shift_id) IS NOT 'open'
        BEGIN
            SELECT RAISE(ABORT, 'shift is not open');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_sales_frozen_update
        BEFORE UPDATE ON sales
        WHEN NEW.shift_id IS NOT OLD.shift_id
          OR (SELECT status FROM shifts WHERE id = OLD.shift_id) IS NOT 'open'
        BEGIN
            SELECT RAISE(ABORT, 'sale belongs to a closed shift');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_sales_frozen_delete
        BEFORE DELETE ON sales
        WHEN (SELECT status FROM shifts WHERE id = OLD.shift_id) IS NOT 'open'
        BEGIN
            SELECT RAISE(ABORT, 'sale belongs to a closed shift');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_shift_employees_require_open
        BEFORE INSERT ON shift_employees
        WHEN (SELECT status FROM shifts WHERE id = NEW.shift_id) IS NOT 'open'
        BEGIN
            SELECT RAISE(ABORT, 'shift is not open');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_shift_payments_require_open
        BEFORE INSERT ON shift_payments
        WHEN (SELECT status FROM shifts WHERE id = NEW.shift_id) IS NOT 'open'
        BEGIN
            SELECT RAISE(ABORT, 'shift is not open');
        END;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| migration_error(2, e))?;

    info!("Applied migration v2 (shift ledger tables)");
    Ok(())
}

/// Migration v3: idempotency key for shift opens.
fn migrate_v3(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_shifts_client_request_id_unique
            ON shifts(client_request_id)
            WHERE client_request_id IS NOT NULL;

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| migration_error(3, e))?;

    info!("Applied migration v3 (shift open idempotency index)");
    Ok(())
}

/// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`, rolling back on any error.
///
/// IMMEDIATE takes the write lock up front, so everything `f` reads is
/// consistent with what it writes.
pub fn with_immediate_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> LedgerResult<T>,
) -> LedgerResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 (millisecond precision, `Z` suffix) so stored
/// timestamps order correctly as text.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> LedgerResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_db() -> DbState {
    open_in_memory().expect("open in-memory ledger db")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    fn insert_open_shift(conn: &Connection, id: &str, scope: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO shifts (id, scope_key, status, opened_at, opening_minor, created_at, updated_at)
             VALUES (?1, ?2, 'open', datetime('now'), 0, datetime('now'), datetime('now'))",
            params![id, scope],
        )
    }

    #[test]
    fn test_migrations_create_ledger_tables() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "sales",
            "schema_version",
            "shift_employees",
            "shift_payments",
            "shifts",
            "sync_queue",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = test_db();
        let conn = db.lock().unwrap();
        run_migrations(&conn).expect("second run");
        let rows: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("station-ledger-db-{}", uuid::Uuid::new_v4()));
        let db = init(&dir, Duration::from_millis(500)).expect("init file db");
        {
            let conn = db.lock().unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
        }
        drop(db);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_unique_index_allows_one_open_shift_per_scope() {
        let db = test_db();
        let conn = db.lock().unwrap();
        insert_open_shift(&conn, "s-1", "global").unwrap();
        let dup = insert_open_shift(&conn, "s-2", "global");
        assert!(dup.is_err(), "second open shift in the same scope must fail");
        // A different scope key is unaffected.
        insert_open_shift(&conn, "s-3", "e-7").unwrap();
    }

    #[test]
    fn test_closed_shift_rows_are_frozen() {
        let db = test_db();
        let conn = db.lock().unwrap();
        insert_open_shift(&conn, "s-1", "global").unwrap();
        conn.execute(
            "UPDATE shifts SET status = 'closed', closed_at = datetime('now'), closing_minor = 0
             WHERE id = 's-1'",
            [],
        )
        .unwrap();

        let update = conn.execute("UPDATE shifts SET closing_minor = 5 WHERE id = 's-1'", []);
        assert!(update.is_err(), "closed shift must reject updates");

        let delete = conn.execute("DELETE FROM shifts WHERE id = 's-1'", []);
        assert!(delete.is_err(), "shifts must never be deleted");

        let sale = conn.execute(
            "INSERT INTO sales (id, shift_id, employee_id, amount_minor, created_at)
             VALUES ('sale-1', 's-1', 'e1', 100, datetime('now'))",
            [],
        );
        assert!(sale.is_err(), "sales must not attach to a closed shift");

        // A new open shift in the same scope is allowed once the old one closed.
        insert_open_shift(&conn, "s-2", "global").unwrap();
    }

    #[test]
    fn test_close_requires_closing_fields_together() {
        let db = test_db();
        let conn = db.lock().unwrap();
        insert_open_shift(&conn, "s-1", "global").unwrap();
        let half_close = conn.execute(
            "UPDATE shifts SET status = 'closed', closed_at = datetime('now') WHERE id = 's-1'",
            [],
        );
        assert!(half_close.is_err());
    }

    #[test]
    fn test_sale_for_unknown_shift_rejected() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let sale = conn.execute(
            "INSERT INTO sales (id, shift_id, employee_id, amount_minor, created_at)
             VALUES ('sale-1', 'missing', 'e1', 100, datetime('now'))",
            [],
        );
        assert!(sale.is_err());
    }

    #[test]
    fn test_immediate_tx_rolls_back_on_error() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let result: LedgerResult<()> = with_immediate_tx(&conn, |conn| {
            set_setting(conn, "ledger", "scratch", "1")?;
            Err(LedgerError::NoActiveShift)
        });
        assert!(matches!(result, Err(LedgerError::NoActiveShift)));
        assert_eq!(get_setting(&conn, "ledger", "scratch").unwrap(), None);
    }

    #[test]
    fn test_settings_crud() {
        let db = test_db();
        let conn = db.lock().unwrap();
        set_setting(&conn, "ledger", "shift_scope", "global").expect("set");
        assert_eq!(
            get_setting(&conn, "ledger", "shift_scope").unwrap(),
            Some("global".to_string())
        );
        set_setting(&conn, "ledger", "shift_scope", "per_employee").expect("update");
        assert_eq!(
            get_setting(&conn, "ledger", "shift_scope").unwrap(),
            Some("per_employee".to_string())
        );
    }
}
