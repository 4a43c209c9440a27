use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::AnalysisConfig;
use crate::core::orchestrator::{DrainOutcome, Orchestrator};
use crate::core::store::Store;
use crate::core::terminal;
use crate::logging::init_logging;

/// One foreground loop, for external schedulers. Ctrl+C stops after the current job.
pub async fn run_drain(config: AnalysisConfig) -> Result<()> {
    init_logging(&config.log_level);
    let config = Arc::new(config);
    let store = Store::open(&config.db_path).await?;
    let orchestrator = Orchestrator::new(store, config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stopping after the current job");
            on_signal.cancel();
        }
    });

    match orchestrator.drain(&cancel).await? {
        DrainOutcome::LockBusy => {
            terminal::print_warn("Another analysis runner holds the lock; nothing to do.")
        }
        DrainOutcome::Drained(summary) => terminal::print_drain_summary(&summary),
    }
    Ok(())
}
