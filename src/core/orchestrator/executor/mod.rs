//! The drain loop: take the runner lock, pull jobs off the queue one at a
//! time, run them, and record the outcome.
//!
//! Per-job work lives in [job]. Cancellation is cooperative: stop commands
//! are read only before a job starts and right after its execution returns.

mod job;

use anyhow::{Result, anyhow};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::AnalysisConfig;
use crate::core::orchestrator::types::{DrainOutcome, DrainSummary, JobOutcome};
use crate::core::pipeline::{IntegrationClient, StepRunner};
use crate::core::store::types::{EventType, NewEvent};
use crate::core::store::{ANALYSIS_LOCK_KEY, RunnerLock, Store};

/// Event source for everything the loop itself records.
pub(crate) const LOOP_SOURCE: &str = "analysis";

#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    config: Arc<AnalysisConfig>,
    runner: StepRunner,
}

impl Orchestrator {
    pub fn new(store: Store, config: Arc<AnalysisConfig>) -> Result<Self> {
        let base = config
            .integration_base()
            .ok_or_else(|| anyhow!("AI integration base URL is not configured"))?;
        let client =
            IntegrationClient::new(&base, config.step_timeout(), config.health_timeout())?;
        let runner = StepRunner::new(client, store.clone(), config.clone());
        Ok(Self {
            store,
            config,
            runner,
        })
    }

    pub fn runner(&self) -> &StepRunner {
        &self.runner
    }

    /// Run one orchestration loop until the queue is empty or `cancel` fires.
    ///
    /// Returns `LockBusy` without touching anything if another loop holds the
    /// runner lock. The lock is released whatever the loop body returns.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<DrainOutcome> {
        let lock = self.config.use_lock.then(|| {
            RunnerLock::new(
                self.store.clone(),
                ANALYSIS_LOCK_KEY,
                self.config.lock_lease(),
            )
        });

        if let Some(lock) = &lock
            && !lock.try_acquire().await?
        {
            debug!("Analysis runner lock is held elsewhere, skipping drain");
            return Ok(DrainOutcome::LockBusy);
        }

        let result = self.drain_locked(lock.as_ref(), cancel).await;

        if let Some(lock) = &lock {
            match lock.release().await {
                Ok(true) => debug!("Analysis runner lock released"),
                Ok(false) => warn!("Analysis runner lock was no longer held at release"),
                Err(e) => warn!("Failed to release analysis runner lock: {}", e),
            }
        }

        result.map(DrainOutcome::Drained)
    }

    async fn drain_locked(
        &self,
        lock: Option<&RunnerLock>,
        cancel: &CancellationToken,
    ) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        let mut stop_set: HashSet<String> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                info!("Shutdown requested, leaving remaining jobs queued");
                break;
            }
            if let Some(lock) = lock
                && !lock.renew().await?
            {
                warn!("Analysis runner lock lost, ending drain");
                break;
            }

            let Some(item) = self.store.dequeue_next().await? else {
                break;
            };

            self.absorb_stop_commands(&mut stop_set).await;
            if stop_set.contains(&item.company_id) {
                self.skip_stopped(&item.company_id).await;
                summary.record(JobOutcome::stopped_before_start(&item.company_id));
                continue;
            }

            let outcome = self.process_job(item, &mut stop_set).await;
            summary.record(outcome);
        }

        if summary.processed > 0 {
            info!("Analysis drain finished: {}", summary.describe());
            self.log(
                NewEvent::notification(
                    "analysis_summary",
                    None,
                    format!("Analysis run finished: {}", summary.describe()),
                )
                .with_payload(serde_json::json!({
                    "processed": summary.processed,
                    "completed": summary.completed,
                    "failed": summary.failed,
                    "deferred": summary.deferred,
                    "stopped": summary.stopped,
                    "outcomes": summary.outcomes,
                })),
            )
            .await;
        }
        Ok(summary)
    }

    /// Consume pending stop commands into `stop_set`. Listed companies leave
    /// the queue, and those not currently running are marked stopped.
    async fn absorb_stop_commands(&self, stop_set: &mut HashSet<String>) {
        let commands = match self.store.take_stop_commands().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read stop commands: {}", e);
                return;
            }
        };

        for cmd in commands {
            let ids = cmd.payload.company_ids;
            if ids.is_empty() {
                continue;
            }
            if let Err(e) = self.store.remove_from_queue(&ids).await {
                warn!("Failed to remove stopped companies from queue: {}", e);
            }
            for id in ids {
                match self.store.stop_if_pending(&id).await {
                    Ok(true) => {
                        self.log(NewEvent::notification(
                            "analysis_stopped",
                            Some(&id),
                            "Analysis cancelled before start",
                        ))
                        .await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Failed to mark {} stopped: {}", id, e),
                }
                stop_set.insert(id);
            }
        }
    }

    async fn skip_stopped(&self, company_id: &str) {
        info!("Skipping {}: stop requested", company_id);
        match self.store.stop_if_pending(company_id).await {
            Ok(true) => {
                self.log(NewEvent::notification(
                    "analysis_stopped",
                    Some(company_id),
                    "Analysis cancelled before start",
                ))
                .await;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to mark {} stopped: {}", company_id, e),
        }
    }

    pub(crate) async fn log(&self, event: NewEvent) {
        if let Err(e) = self.store.append_event(&event).await {
            warn!("Failed to record analysis event: {}", e);
        }
    }

    pub(crate) async fn log_error(&self, company_id: &str, message: String) {
        self.log(
            NewEvent::new(EventType::Error, LOOP_SOURCE)
                .with_company(company_id)
                .with_message(message),
        )
        .await;
    }
}
