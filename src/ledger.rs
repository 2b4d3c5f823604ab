//! Async facade over the ledger services.
//!
//! Every operation runs on tokio's blocking pool under a deadline. Lock
//! contention (`Busy`) is retried with exponential backoff because the
//! transaction rolled back in full. A missed deadline is reported as
//! `OutcomeUnknown` and never retried: the write may still commit.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::config::{self, LedgerConfig};
use crate::db::{self, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{CloseShiftRequest, OpenShiftRequest, Sale, SaleDetails, Shift, ShiftFilter};
use crate::sales;
use crate::shifts::{self, ClosedShift, ShiftSummary};
use crate::sync::{self, SyncBacklog, SyncEntry};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ShiftLedger {
    db: Arc<DbState>,
    config: Arc<LedgerConfig>,
}

impl ShiftLedger {
    /// Open the database under `config.data_dir` and pin the scope policy.
    pub fn open(config: LedgerConfig) -> LedgerResult<Self> {
        let db = db::init(&config.data_dir, config.busy_timeout)?;
        Self::with_db(db, config)
    }

    pub fn with_db(db: DbState, config: LedgerConfig) -> LedgerResult<Self> {
        config::pin_scope(&db, config.policy.scope)?;
        Ok(ShiftLedger {
            db: Arc::new(db),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    pub async fn open_shift(&self, req: OpenShiftRequest) -> LedgerResult<Shift> {
        let policy = self.config.policy;
        self.run("open_shift", move |db| shifts::open_shift(db, &policy, &req))
            .await
    }

    pub async fn close_shift(&self, req: CloseShiftRequest) -> LedgerResult<ClosedShift> {
        self.run("close_shift", move |db| shifts::close_shift(db, &req))
            .await
    }

    /// Open shift `employee_id` works on (ignored under the global scope).
    pub async fn active_shift(&self, employee_id: Option<String>) -> LedgerResult<Option<Shift>> {
        let scope = self.config.policy.scope;
        self.run("get_active_shift", move |db| {
            shifts::get_active(db, scope, employee_id.as_deref())
        })
        .await
    }

    pub async fn shift(&self, shift_id: String) -> LedgerResult<Option<Shift>> {
        self.run("get_shift", move |db| shifts::get_shift(db, &shift_id))
            .await
    }

    pub async fn list_shifts(&self, filter: ShiftFilter) -> LedgerResult<Vec<Shift>> {
        self.run("list_shifts", move |db| shifts::list_shifts(db, &filter))
            .await
    }

    pub async fn shift_summary(&self, shift_id: String) -> LedgerResult<ShiftSummary> {
        self.run("shift_summary", move |db| shifts::shift_summary(db, &shift_id))
            .await
    }

    pub async fn find_shift_by_request(&self, request_id: String) -> LedgerResult<Option<Shift>> {
        self.run("find_shift_by_request", move |db| {
            shifts::find_by_request(db, &request_id)
        })
        .await
    }

    pub async fn create_sale(&self, details: SaleDetails) -> LedgerResult<Sale> {
        let scope = self.config.policy.scope;
        self.run("create_sale", move |db| sales::create_sale(db, scope, &details))
            .await
    }

    pub async fn list_sales(&self, shift_id: String) -> LedgerResult<Vec<Sale>> {
        self.run("list_sales", move |db| sales::list_sales(db, &shift_id))
            .await
    }

    pub async fn sync_pending(&self, limit: u32) -> LedgerResult<Vec<SyncEntry>> {
        self.run("sync_pending", move |db| sync::pending(db, limit))
            .await
    }

    pub async fn sync_mark_synced(&self, id: i64) -> LedgerResult<()> {
        self.run("sync_mark_synced", move |db| sync::mark_synced(db, id))
            .await
    }

    pub async fn sync_mark_failed(&self, id: i64, error: String) -> LedgerResult<String> {
        self.run("sync_mark_failed", move |db| sync::mark_failed(db, id, &error))
            .await
    }

    pub async fn sync_backlog(&self) -> LedgerResult<SyncBacklog> {
        self.run("sync_backlog", sync::backlog).await
    }

    /// Run a blocking ledger operation under the configured deadline,
    /// retrying only on `Busy`.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: Fn(&DbState) -> LedgerResult<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let deadline = self.config.op_timeout;
        let mut attempt: u32 = 0;

        loop {
            let db = Arc::clone(&self.db);
            let op = Arc::clone(&f);
            let task = tokio::task::spawn_blocking(move || op(&db));

            let outcome = match timeout(deadline, task).await {
                Err(_) => {
                    warn!(
                        operation,
                        timeout_ms = deadline.as_millis() as u64,
                        "Ledger operation timed out, outcome unknown"
                    );
                    return Err(LedgerError::OutcomeUnknown {
                        operation,
                        timeout_ms: deadline.as_millis() as u64,
                    });
                }
                Ok(Err(join_err)) => {
                    error!(operation, error = %join_err, "Ledger worker task failed");
                    return Err(LedgerError::Storage(format!(
                        "{operation} worker failed: {join_err}"
                    )));
                }
                Ok(Ok(outcome)) => outcome,
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < self.config.busy_retries => {
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Storage busy, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(operation, attempts = attempt + 1, "Storage still busy, giving up");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.config
            .retry_base
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}
