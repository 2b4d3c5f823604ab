//! Station Ledger - shift lifecycle and cash reconciliation for a fuel-station
//! dashboard.
//!
//! The binary speaks line-delimited JSON on stdin/stdout; see
//! [`commands::dispatch`] for the command names. Library users can drive the
//! async [`ledger::ShiftLedger`] facade directly.

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod ledger;
pub mod models;
pub mod money;
pub mod reconcile;
pub mod sales;
pub mod shifts;
pub mod sync;

pub use config::{LedgerConfig, LedgerPolicy};
pub use error::{LedgerError, LedgerResult};
pub use ledger::ShiftLedger;

// ============================================================================
// Entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;
    let _log_guard = init_logging(&config)?;

    info!("Starting Station Ledger v{}", env!("CARGO_PKG_VERSION"));
    info!(
        data_dir = %config.data_dir.display(),
        scope = config.policy.scope.as_str(),
        cash_basis = config.policy.cash_basis.as_str(),
        "Ledger configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async move {
        let ledger = ShiftLedger::open(config).context("failed to open ledger")?;
        serve(&ledger, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
        info!("Input closed, shutting down");
        Ok(())
    })
}

/// Structured logging: console on stderr (stdout carries responses) plus a
/// daily rolling file. The returned guard flushes the file writer on drop.
pub fn init_logging(config: &LedgerConfig) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,station_ledger_lib=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(&config.log_dir);

    std::fs::create_dir_all(&config.log_dir).with_context(|| {
        format!("failed to create log dir {}", config.log_dir.display())
    })?;

    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

/// Answer request lines until the reader is exhausted.
pub async fn serve<R, W>(ledger: &ShiftLedger, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let Some(response) = commands::handle_line(ledger, &line).await else {
            continue;
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
