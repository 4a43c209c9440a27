use std::collections::HashSet;
use std::time::Instant;
use tracing::{info, warn};

use super::Orchestrator;
use crate::core::orchestrator::can_transition;
use crate::core::orchestrator::types::{JobOutcome, JobPhase};
use crate::core::pipeline::{AnalysisMode, StepKey, StepResult};
use crate::core::store::types::{AnalysisStatus, FinishedState, NewEvent, QueueItem};

/// Per-job bookkeeping. Kept outside the timed future so whatever finished
/// before a timeout is still known afterwards.
struct RunProgress {
    company_id: String,
    phase: JobPhase,
    completed: Vec<StepKey>,
    failed_step: Option<&'static str>,
}

impl RunProgress {
    fn new(company_id: &str, completed: Vec<StepKey>) -> Self {
        Self {
            company_id: company_id.to_string(),
            phase: JobPhase::Dequeued,
            completed,
            failed_step: None,
        }
    }

    fn advance(&mut self, to: JobPhase) {
        if !can_transition(self.phase, to) {
            warn!(
                "Unexpected phase change for {}: {} -> {}",
                self.company_id,
                self.phase.as_str(),
                to.as_str()
            );
        }
        self.phase = to;
    }

    fn fraction(&self, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (self.completed.len() as f64 / total as f64).min(1.0)
    }

    fn outcome(&self, result: Option<&StepResult>, duration_seconds: f64) -> JobOutcome {
        JobOutcome {
            company_id: self.company_id.clone(),
            status: self.phase,
            completed_steps: self.completed.clone(),
            last_status: result.map(|r| r.status),
            error: result.and_then(|r| r.error.clone()),
            duration_seconds,
        }
    }
}

impl Orchestrator {
    /// Run one dequeued job to a final phase. Never returns an error: store
    /// failures end the job as failed.
    pub(crate) async fn process_job(
        &self,
        item: QueueItem,
        stop_set: &mut HashSet<String>,
    ) -> JobOutcome {
        let started = Instant::now();
        match self.run_job(&item, stop_set, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let id = item.company_id.as_str();
                let duration = started.elapsed().as_secs_f64();
                warn!("Analysis job for {} aborted: {}", id, e);
                self.log_error(id, format!("Analysis job aborted: {}", e))
                    .await;

                let info = serde_json::json!({ "error": e.to_string() });
                let finished = FinishedState {
                    status: AnalysisStatus::Failed,
                    progress: None,
                    duration_seconds: duration,
                    analysis_ok: false,
                    server_error: true,
                    info: &info,
                };
                if let Err(e) = self.store.mark_finished(id, finished).await {
                    warn!("Failed to mark {} failed: {}", id, e);
                }
                self.log(NewEvent::notification(
                    "analysis_failed",
                    Some(id),
                    "Analysis failed: internal error",
                ))
                .await;
                self.pick_up_pending_request(id).await;

                JobOutcome {
                    company_id: id.to_string(),
                    status: JobPhase::Failed,
                    completed_steps: Vec::new(),
                    last_status: None,
                    error: Some(e.to_string()),
                    duration_seconds: duration,
                }
            }
        }
    }

    async fn run_job(
        &self,
        item: &QueueItem,
        stop_set: &mut HashSet<String>,
        started: Instant,
    ) -> anyhow::Result<JobOutcome> {
        let id = item.company_id.as_str();
        let payload = &item.payload;
        let mode = payload.mode;
        let planned = payload.planned_steps();
        let total = match mode {
            AnalysisMode::Steps => planned.len(),
            AnalysisMode::Full => 1,
        };

        let already_done: Vec<StepKey> = payload
            .completed_steps
            .iter()
            .copied()
            .filter(|s| planned.contains(s))
            .collect();
        let mut progress = RunProgress::new(id, already_done);
        let initial = match mode {
            AnalysisMode::Steps => progress.fraction(total),
            AnalysisMode::Full => 0.0,
        };
        let first_stage = match mode {
            AnalysisMode::Full => Some("full"),
            AnalysisMode::Steps => payload.remaining_steps().first().map(|s| s.as_str()),
        };

        self.store.mark_running(id, first_stage, initial).await?;
        info!(
            "Analysis of {} started ({} mode, defer {})",
            id,
            mode.as_str(),
            payload.defer_count
        );
        self.log(
            NewEvent::notification(
                "analysis_start",
                Some(id),
                format!("Analysis started ({} mode)", mode.as_str()),
            )
            .with_payload(serde_json::json!({
                "mode": mode,
                "steps": planned,
                "completedSteps": progress.completed,
                "deferCount": payload.defer_count,
            })),
        )
        .await;

        let job_timeout = self.config.job_timeout();
        let result = match tokio::time::timeout(
            job_timeout,
            self.execute_plan(id, mode, &planned, &mut progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Analysis of {} timed out after {:?}", id, job_timeout);
                self.log_error(
                    id,
                    format!(
                        "Analysis job timed out after {} ms",
                        job_timeout.as_millis()
                    ),
                )
                .await;
                StepResult::timed_out(job_timeout)
            }
        };
        let duration = started.elapsed().as_secs_f64();

        // The row was consumed at dequeue. Anything queued for `id` now is a
        // newer request and stays.
        self.absorb_stop_commands(stop_set).await;
        if stop_set.contains(id) {
            progress.advance(JobPhase::Stopped);
            self.store.mark_stopped(id, Some(duration)).await?;
            self.log(NewEvent::notification(
                "analysis_stopped",
                Some(id),
                "Analysis stopped on request",
            ))
            .await;
            info!("Analysis of {} stopped on request", id);
            return Ok(progress.outcome(Some(&result), duration));
        }

        let mut info = serde_json::json!({
            "mode": mode,
            "steps": planned,
            "completedSteps": progress.completed,
            "lastStatus": result.status,
            "error": result.error,
            "deferCount": payload.defer_count,
            "failedStep": progress.failed_step,
        });

        if result.ok {
            progress.advance(JobPhase::Completed);
            self.store
                .mark_finished(
                    id,
                    FinishedState {
                        status: AnalysisStatus::Completed,
                        progress: Some(1.0),
                        duration_seconds: duration,
                        analysis_ok: true,
                        server_error: false,
                        info: &info,
                    },
                )
                .await?;
            self.log(
                NewEvent::notification(
                    "analysis_success",
                    Some(id),
                    format!("Analysis completed in {:.1}s", duration),
                )
                .with_payload(serde_json::json!({ "durationSeconds": duration })),
            )
            .await;
            info!("Analysis of {} completed in {:.1}s", id, duration);
            self.pick_up_pending_request(id).await;
            return Ok(progress.outcome(Some(&result), duration));
        }

        if result.reports_no_valid_site() {
            self.store.set_no_valid_site(id).await?;
            self.log(NewEvent::notification(
                "no_valid_site",
                Some(id),
                "AI service found no valid website",
            ))
            .await;
        }

        let error_text = result
            .error
            .clone()
            .unwrap_or_else(|| format!("HTTP {}", result.status));

        if payload.defer_count < self.config.max_defers {
            let mut next = payload.clone();
            next.defer_count += 1;
            next.completed_steps = progress.completed.clone();
            info["deferCount"] = serde_json::json!(next.defer_count);

            let requeued = self
                .store
                .enqueue_if_absent(id, &next, item.queued_by.as_deref())
                .await?;
            if !requeued {
                info!("Newer request for {} already queued, not requeuing retry", id);
            }
            self.store.mark_deferred(id, &info).await?;
            progress.advance(JobPhase::Deferred);
            self.log(
                NewEvent::notification(
                    "analysis_deferred",
                    Some(id),
                    format!(
                        "Analysis deferred ({}/{}): {}",
                        next.defer_count, self.config.max_defers, error_text
                    ),
                )
                .with_payload(serde_json::json!({
                    "deferCount": next.defer_count,
                    "completedSteps": next.completed_steps,
                    "status": result.status,
                })),
            )
            .await;
            info!(
                "Analysis of {} deferred ({}/{})",
                id, next.defer_count, self.config.max_defers
            );
            return Ok(progress.outcome(Some(&result), duration));
        }

        progress.advance(JobPhase::Failed);
        self.store
            .mark_finished(
                id,
                FinishedState {
                    status: AnalysisStatus::Failed,
                    progress: None,
                    duration_seconds: duration,
                    analysis_ok: false,
                    server_error: true,
                    info: &info,
                },
            )
            .await?;
        self.log(
            NewEvent::notification(
                "analysis_failed",
                Some(id),
                format!("Analysis failed: {}", error_text),
            )
            .with_payload(serde_json::json!({
                "status": result.status,
                "failedStep": progress.failed_step,
            })),
        )
        .await;
        warn!("Analysis of {} failed: {}", id, error_text);
        self.pick_up_pending_request(id).await;
        Ok(progress.outcome(Some(&result), duration))
    }

    async fn pick_up_pending_request(&self, id: &str) {
        match self.store.requeue_if_pending(id).await {
            Ok(true) => info!("{} was requested again during its run, back in queue", id),
            Ok(false) => {}
            Err(e) => warn!("Failed to check pending request for {}: {}", id, e),
        }
    }

    /// Run the remaining plan in order, stopping at the first failure.
    async fn execute_plan(
        &self,
        id: &str,
        mode: AnalysisMode,
        planned: &[StepKey],
        progress: &mut RunProgress,
    ) -> StepResult {
        // Each call below is gated by its own health probe.
        progress.advance(JobPhase::HealthChecked);

        if mode == AnalysisMode::Full {
            progress.advance(JobPhase::StepExecuting);
            let result = self.runner.run_full_pipeline(id).await;
            if result.ok {
                progress.completed = planned.to_vec();
                progress.advance(JobPhase::Progressing);
                self.record_progress(id, "full", 1.0).await;
            } else {
                progress.failed_step = Some("full");
            }
            return result;
        }

        let total = planned.len();
        let remaining: Vec<StepKey> = planned
            .iter()
            .copied()
            .filter(|s| !progress.completed.contains(s))
            .collect();

        let mut last = StepResult::success(200, None);
        for step in remaining {
            progress.advance(JobPhase::StepExecuting);
            self.record_progress(id, step.as_str(), progress.fraction(total))
                .await;

            let result = self.runner.run_step(id, step).await;
            if !result.ok {
                progress.failed_step = Some(step.as_str());
                return result;
            }
            progress.completed.push(step);
            progress.advance(JobPhase::Progressing);
            self.record_progress(id, step.as_str(), progress.fraction(total))
                .await;
            last = result;
        }
        last
    }

    async fn record_progress(&self, id: &str, stage: &str, fraction: f64) {
        if let Err(e) = self.store.update_progress(id, stage, fraction).await {
            warn!("Failed to record progress for {}: {}", id, e);
        }
    }
}
