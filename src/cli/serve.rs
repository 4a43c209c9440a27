use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::config::AnalysisConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::BackgroundRunner;
use crate::core::store::Store;
use crate::core::terminal;
use crate::interfaces::web::{ApiServer, AppState};
use crate::logging::init_logging;

pub async fn run_serve(config: AnalysisConfig) -> Result<()> {
    let log_tx = init_logging(&config.log_level);
    let config = Arc::new(config);

    info!("Starting analysisd...");
    let store = Store::open(&config.db_path).await?;
    let runner = BackgroundRunner::new(store.clone(), config.clone());
    let state = AppState::new(store, config.clone(), runner.clone(), log_tx);

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(state))));
    lifecycle.attach(Arc::new(Mutex::new(runner.clone())));

    if let Some(cron) = config.sweep_cron.as_deref().filter(|c| !c.trim().is_empty()) {
        match runner.sweep_job(cron) {
            Ok(job) => {
                lifecycle.scheduler.add(job).await?;
                info!("Queue sweep scheduled ({})", cron);
            }
            Err(e) => warn!("Invalid sweep_cron '{}': {}", cron, e),
        }
    }

    lifecycle.start().await?;

    terminal::print_link(
        "API",
        &format!("http://{}:{}", config.host, config.port),
    );
    match config.integration_base() {
        Some(base) => terminal::print_status("AI integration", &base),
        None => terminal::print_warn("AI_INTEGRATION_BASE is not set; enqueue requests will be refused."),
    }
    terminal::print_status("Database", &config.db_path.display().to_string());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    Ok(())
}
