use serde::Serialize;

use crate::core::pipeline::StepKey;

/// Where a single dequeued job is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Dequeued,
    HealthChecked,
    StepExecuting,
    Progressing,
    Deferred,
    Completed,
    Failed,
    Stopped,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Dequeued => "dequeued",
            JobPhase::HealthChecked => "health_checked",
            JobPhase::StepExecuting => "step_executing",
            JobPhase::Progressing => "progressing",
            JobPhase::Deferred => "deferred",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::Stopped => "stopped",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "dequeued" => Some(JobPhase::Dequeued),
            "health_checked" => Some(JobPhase::HealthChecked),
            "step_executing" => Some(JobPhase::StepExecuting),
            "progressing" => Some(JobPhase::Progressing),
            "deferred" => Some(JobPhase::Deferred),
            "completed" => Some(JobPhase::Completed),
            "failed" => Some(JobPhase::Failed),
            "stopped" => Some(JobPhase::Stopped),
            _ => None,
        }
    }

    /// The job left the loop with this phase.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            JobPhase::Deferred | JobPhase::Completed | JobPhase::Failed | JobPhase::Stopped
        )
    }
}

/// Result of one pass of one company through the loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub company_id: String,
    pub status: JobPhase,
    pub completed_steps: Vec<StepKey>,
    pub last_status: Option<u16>,
    pub error: Option<String>,
    pub duration_seconds: f64,
}

impl JobOutcome {
    pub fn stopped_before_start(company_id: &str) -> Self {
        Self {
            company_id: company_id.to_string(),
            status: JobPhase::Stopped,
            completed_steps: Vec::new(),
            last_status: None,
            error: None,
            duration_seconds: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSummary {
    /// Jobs taken off the queue, deferred re-runs counted each time.
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub stopped: usize,
    /// Latest outcome per company, in first-seen order.
    pub outcomes: Vec<JobOutcome>,
}

impl DrainSummary {
    pub fn record(&mut self, outcome: JobOutcome) {
        self.processed += 1;
        match outcome.status {
            JobPhase::Completed => self.completed += 1,
            JobPhase::Failed => self.failed += 1,
            JobPhase::Deferred => self.deferred += 1,
            JobPhase::Stopped => self.stopped += 1,
            _ => {}
        }
        match self
            .outcomes
            .iter_mut()
            .find(|o| o.company_id == outcome.company_id)
        {
            Some(existing) => *existing = outcome,
            None => self.outcomes.push(outcome),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} jobs ({} completed, {} failed, {} deferred, {} stopped)",
            self.processed, self.completed, self.failed, self.deferred, self.stopped
        )
    }
}

/// How a call to `Orchestrator::drain` ended.
#[derive(Debug, Clone)]
pub enum DrainOutcome {
    /// Another loop holds the runner lock; nothing was done.
    LockBusy,
    Drained(DrainSummary),
}
