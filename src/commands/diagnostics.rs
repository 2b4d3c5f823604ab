use serde_json::{json, Value};

use crate::diagnostics;
use crate::error::LedgerResult;
use crate::ledger::ShiftLedger;

pub async fn diagnostics_health(ledger: &ShiftLedger) -> LedgerResult<Value> {
    let mut health = ledger
        .run("diagnostics_health", diagnostics::system_health)
        .await?;
    let config = ledger.config();
    health["policy"] = json!({
        "shiftScope": config.policy.scope,
        "cashBasis": config.policy.cash_basis,
        "opTimeoutMs": config.op_timeout.as_millis() as u64,
        "busyRetries": config.busy_retries,
    });
    health["logDir"] = json!(config.log_dir.display().to_string());
    Ok(json!({ "success": true, "health": health }))
}

#[cfg(test)]
mod tests {
    use crate::commands::dispatch;
    use crate::commands::test_support::memory_ledger;

    #[tokio::test]
    async fn health_reports_policy_and_schema() {
        let ledger = memory_ledger();
        let response = dispatch(&ledger, "diagnostics_health", None).await.unwrap();
        assert_eq!(response["success"], true);
        assert_eq!(response["health"]["policy"]["shiftScope"], "global");
        assert_eq!(response["health"]["shiftScope"], "global");
        assert!(response["health"]["schemaVersion"].is_number());
    }
}
