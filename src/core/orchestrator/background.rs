use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::executor::Orchestrator;
use super::types::DrainOutcome;
use crate::core::config::AnalysisConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::Store;

struct RunnerInner {
    orchestrator: Option<Orchestrator>,
    store: Store,
    tracker: TaskTracker,
    cancel: CancellationToken,
    busy: AtomicBool,
}

/// Owns the drain task. `kick()` is fire-and-forget for callers; the task is
/// tracked so shutdown can wait for the job in flight.
#[derive(Clone)]
pub struct BackgroundRunner {
    inner: Arc<RunnerInner>,
}

impl BackgroundRunner {
    pub fn new(store: Store, config: Arc<AnalysisConfig>) -> Self {
        let orchestrator = match Orchestrator::new(store.clone(), config) {
            Ok(o) => Some(o),
            Err(e) => {
                warn!("Background analysis runner disabled: {}", e);
                None
            }
        };
        Self {
            inner: Arc::new(RunnerInner {
                orchestrator,
                store,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                busy: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.orchestrator.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Start a drain in the background unless one is already running here.
    /// Returns whether a task was spawned.
    pub fn kick(&self) -> bool {
        if self.inner.cancel.is_cancelled() || self.inner.orchestrator.is_none() {
            return false;
        }
        if self.inner.busy.swap(true, Ordering::SeqCst) {
            debug!("Analysis drain already running in this process");
            return false;
        }
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.drain_cycle().await;
        });
        true
    }

    async fn drain_cycle(&self) {
        let Some(orchestrator) = &self.inner.orchestrator else {
            self.inner.busy.store(false, Ordering::SeqCst);
            return;
        };

        let outcome = orchestrator.drain(&self.inner.cancel).await;
        self.inner.busy.store(false, Ordering::SeqCst);

        match outcome {
            Ok(DrainOutcome::Drained(_)) => {
                // A job enqueued while the loop was finishing would otherwise
                // wait for the next sweep.
                if self.inner.cancel.is_cancelled() {
                    return;
                }
                match self.inner.store.queue_len().await {
                    Ok(n) if n > 0 => {
                        debug!("{} jobs queued after drain, draining again", n);
                        self.kick();
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to re-check analysis queue: {}", e),
                }
            }
            Ok(DrainOutcome::LockBusy) => {}
            Err(e) => error!("Analysis drain failed: {}", e),
        }
    }

    /// Cron job that kicks the runner periodically.
    pub fn sweep_job(&self, cron: &str) -> Result<tokio_cron_scheduler::Job> {
        let runner = self.clone();
        let job = tokio_cron_scheduler::Job::new_async(cron, move |_uuid, mut _l| {
            let runner = runner.clone();
            Box::pin(async move {
                if runner.kick() {
                    debug!("Analysis queue sweep started a drain");
                }
            })
        })?;
        Ok(job)
    }

    /// Stop starting new jobs and wait for the in-flight one.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for BackgroundRunner {
    async fn on_start(&mut self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let pending = self.inner.store.queue_len().await?;
        if pending > 0 {
            info!("Resuming {} queued analysis jobs", pending);
            self.kick();
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Waiting for in-flight analysis job");
        self.shutdown().await;
        Ok(())
    }
}
