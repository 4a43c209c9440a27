mod background;
mod executor;
pub mod types;

pub use background::BackgroundRunner;
pub use executor::Orchestrator;
pub use types::{DrainOutcome, DrainSummary, JobOutcome, JobPhase};

pub fn can_transition(from: JobPhase, to: JobPhase) -> bool {
    if from == to {
        return !from.is_final();
    }
    match from {
        JobPhase::Dequeued => matches!(
            to,
            JobPhase::HealthChecked | JobPhase::Failed | JobPhase::Stopped
        ),
        JobPhase::HealthChecked => matches!(
            to,
            JobPhase::StepExecuting
                | JobPhase::Completed
                | JobPhase::Deferred
                | JobPhase::Failed
                | JobPhase::Stopped
        ),
        JobPhase::StepExecuting => matches!(
            to,
            JobPhase::Progressing
                | JobPhase::Deferred
                | JobPhase::Completed
                | JobPhase::Failed
                | JobPhase::Stopped
        ),
        JobPhase::Progressing => matches!(
            to,
            JobPhase::StepExecuting
                | JobPhase::Deferred
                | JobPhase::Completed
                | JobPhase::Failed
                | JobPhase::Stopped
        ),
        JobPhase::Deferred | JobPhase::Completed | JobPhase::Failed | JobPhase::Stopped => false,
    }
}

#[cfg(test)]
mod tests;
