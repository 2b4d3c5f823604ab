//! Runtime configuration.
//!
//! Values come from `STATION_LEDGER_*` environment variables with defaults.
//! The shift scope is additionally pinned in `local_settings` so that every
//! process sharing a database enforces the same uniqueness boundary.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::db::{self, with_immediate_tx, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{CashBasis, ShiftScope};

pub const ENV_DATA_DIR: &str = "STATION_LEDGER_DATA_DIR";
pub const ENV_LOG_DIR: &str = "STATION_LEDGER_LOG_DIR";
pub const ENV_SHIFT_SCOPE: &str = "STATION_LEDGER_SHIFT_SCOPE";
pub const ENV_CASH_BASIS: &str = "STATION_LEDGER_CASH_BASIS";
pub const ENV_OP_TIMEOUT_MS: &str = "STATION_LEDGER_OP_TIMEOUT_MS";
pub const ENV_BUSY_TIMEOUT_MS: &str = "STATION_LEDGER_BUSY_TIMEOUT_MS";
pub const ENV_BUSY_RETRIES: &str = "STATION_LEDGER_BUSY_RETRIES";
pub const ENV_RETRY_BASE_MS: &str = "STATION_LEDGER_RETRY_BASE_MS";

const SETTINGS_CATEGORY: &str = "ledger";
const SETTING_SHIFT_SCOPE: &str = "shift_scope";

/// Deployment policy applied to every shift operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub scope: ShiftScope,
    /// Basis stamped on shifts opened from now on.
    pub cash_basis: CashBasis,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        LedgerPolicy {
            scope: ShiftScope::Global,
            cash_basis: CashBasis::AllSales,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub policy: LedgerPolicy,
    /// Upper bound for one storage round trip before the outcome is unknown.
    pub op_timeout: Duration,
    /// SQLite busy handler wait.
    pub busy_timeout: Duration,
    /// Retries after a `Busy` error.
    pub busy_retries: u32,
    pub retry_base: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        LedgerConfig {
            log_dir: data_dir.join("logs"),
            data_dir,
            policy: LedgerPolicy::default(),
            op_timeout: Duration::from_millis(10_000),
            busy_timeout: Duration::from_millis(5_000),
            busy_retries: 3,
            retry_base: Duration::from_millis(100),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> LedgerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LedgerResult<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = LedgerConfig::default();

        if let Some(dir) = get(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
            config.log_dir = config.data_dir.join("logs");
        }
        if let Some(dir) = get(ENV_LOG_DIR) {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(scope) = get(ENV_SHIFT_SCOPE) {
            config.policy.scope = scope.parse()?;
        }
        if let Some(basis) = get(ENV_CASH_BASIS) {
            config.policy.cash_basis = basis.parse()?;
        }
        if let Some(ms) = get(ENV_OP_TIMEOUT_MS) {
            config.op_timeout = Duration::from_millis(parse_positive(ENV_OP_TIMEOUT_MS, &ms)?);
        }
        if let Some(ms) = get(ENV_BUSY_TIMEOUT_MS) {
            config.busy_timeout = Duration::from_millis(parse_positive(ENV_BUSY_TIMEOUT_MS, &ms)?);
        }
        if let Some(n) = get(ENV_BUSY_RETRIES) {
            config.busy_retries = n.parse().map_err(|_| {
                LedgerError::Config(format!("{ENV_BUSY_RETRIES} must be a whole number, got {n:?}"))
            })?;
        }
        if let Some(ms) = get(ENV_RETRY_BASE_MS) {
            config.retry_base = Duration::from_millis(parse_positive(ENV_RETRY_BASE_MS, &ms)?);
        }

        Ok(config)
    }
}

fn parse_positive(key: &str, raw: &str) -> LedgerResult<u64> {
    match raw.parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(LedgerError::Config(format!(
            "{key} must be a positive number of milliseconds, got {raw:?}"
        ))),
    }
}

/// `<XDG_DATA_HOME or ~/.local/share>/station-ledger` (LOCALAPPDATA on Windows).
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("station-ledger")
}

/// Record the scope policy in the database, or verify it matches.
///
/// Changing the scope is only allowed while no shift is open; otherwise the
/// existing open shifts would have been admitted under a different key.
pub fn pin_scope(db: &DbState, scope: ShiftScope) -> LedgerResult<()> {
    let conn = db.lock()?;
    with_immediate_tx(&conn, |conn| {
        let stored = db::get_setting(conn, SETTINGS_CATEGORY, SETTING_SHIFT_SCOPE)?;

        match stored.as_deref() {
            None => {
                db::set_setting(conn, SETTINGS_CATEGORY, SETTING_SHIFT_SCOPE, scope.as_str())?;
                info!(scope = scope.as_str(), "Pinned shift scope policy");
            }
            Some(current) if current == scope.as_str() => {}
            Some(current) => {
                let open: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM shifts WHERE status = ?1",
                    params!["open"],
                    |row| row.get(0),
                )?;
                if open > 0 {
                    return Err(LedgerError::Config(format!(
                        "shift scope is pinned to {current:?} while {open} shift(s) are open; \
                         close them before switching to {:?}",
                        scope.as_str()
                    )));
                }
                db::set_setting(conn, SETTINGS_CATEGORY, SETTING_SHIFT_SCOPE, scope.as_str())?;
                warn!(
                    from = %current,
                    to = scope.as_str(),
                    "Shift scope policy changed with no open shifts"
                );
            }
        }
        Ok(())
    })
}

/// Check the pinned scope from inside a write transaction.
///
/// Another process may have re-pinned the database since this one started;
/// writing under a stale scope would key shifts inconsistently. An unpinned
/// database is pinned to `scope`.
pub(crate) fn ensure_pinned_scope(conn: &Connection, scope: ShiftScope) -> LedgerResult<()> {
    match db::get_setting(conn, SETTINGS_CATEGORY, SETTING_SHIFT_SCOPE)?.as_deref() {
        None => db::set_setting(conn, SETTINGS_CATEGORY, SETTING_SHIFT_SCOPE, scope.as_str()),
        Some(current) if current == scope.as_str() => Ok(()),
        Some(current) => Err(LedgerError::Config(format!(
            "database shift scope is now {current:?} but this process runs with {:?}; \
             restart it with the pinned scope",
            scope.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.policy.scope, ShiftScope::Global);
        assert_eq!(config.policy.cash_basis, CashBasis::AllSales);
        assert_eq!(config.op_timeout, Duration::from_secs(10));
        assert_eq!(config.busy_retries, 3);
        assert!(config.data_dir.ends_with("station-ledger"));
        assert_eq!(config.log_dir, config.data_dir.join("logs"));
    }

    #[test]
    fn test_overrides() {
        let config = LedgerConfig::from_lookup(lookup(&[
            (ENV_DATA_DIR, "/srv/ledger"),
            (ENV_SHIFT_SCOPE, "per_employee"),
            (ENV_CASH_BASIS, "cash_tender"),
            (ENV_OP_TIMEOUT_MS, "2500"),
            (ENV_BUSY_RETRIES, "0"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/ledger"));
        assert_eq!(config.log_dir, PathBuf::from("/srv/ledger/logs"));
        assert_eq!(config.policy.scope, ShiftScope::PerEmployee);
        assert_eq!(config.policy.cash_basis, CashBasis::CashTender);
        assert_eq!(config.op_timeout, Duration::from_millis(2500));
        assert_eq!(config.busy_retries, 0);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for pairs in [
            [(ENV_SHIFT_SCOPE, "per_register")],
            [(ENV_CASH_BASIS, "card")],
            [(ENV_OP_TIMEOUT_MS, "0")],
            [(ENV_BUSY_RETRIES, "-1")],
        ] {
            let err = LedgerConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, LedgerError::Config(_)), "{pairs:?}");
        }
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var(ENV_SHIFT_SCOPE, "per_employee");
        std::env::set_var(ENV_RETRY_BASE_MS, "40");
        let config = LedgerConfig::from_env();
        std::env::remove_var(ENV_SHIFT_SCOPE);
        std::env::remove_var(ENV_RETRY_BASE_MS);

        let config = config.unwrap();
        assert_eq!(config.policy.scope, ShiftScope::PerEmployee);
        assert_eq!(config.retry_base, Duration::from_millis(40));
    }

    #[test]
    fn test_pin_scope_rejects_switch_while_shift_open() {
        let db = db::test_db();
        pin_scope(&db, ShiftScope::Global).unwrap();
        pin_scope(&db, ShiftScope::Global).unwrap();

        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO shifts (id, scope_key, status, opened_at, opening_minor, created_at, updated_at)
                 VALUES ('s-1', 'global', 'open', datetime('now'), 0, datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
        }

        let err = pin_scope(&db, ShiftScope::PerEmployee).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn test_pin_scope_switch_allowed_when_idle() {
        let db = db::test_db();
        pin_scope(&db, ShiftScope::Global).unwrap();
        pin_scope(&db, ShiftScope::PerEmployee).unwrap();
        let conn = db.lock().unwrap();
        assert_eq!(
            db::get_setting(&conn, "ledger", "shift_scope").unwrap(),
            Some("per_employee".to_string())
        );
    }

    #[test]
    fn test_ensure_pinned_scope_rejects_stale_process_policy() {
        let db = db::test_db();
        let conn = db.lock().unwrap();

        ensure_pinned_scope(&conn, ShiftScope::Global).unwrap();
        assert_eq!(
            db::get_setting(&conn, "ledger", "shift_scope").unwrap(),
            Some("global".to_string())
        );
        ensure_pinned_scope(&conn, ShiftScope::Global).unwrap();

        db::set_setting(&conn, "ledger", "shift_scope", "per_employee").unwrap();
        let err = ensure_pinned_scope(&conn, ShiftScope::Global).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }
}
