use crate::{FaultClass, TaskFailure};

pub type TaskId = u64;

/// How a single pool task ended. Observed exactly once by the fault monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task finished and persisted this many records.
    Success(usize),
    Failed(TaskFailure),
    /// The task never started because the pool was stopped first.
    Cancelled,
    /// The task was stopped mid-flight, cooperatively or by force.
    Interrupted,
}

impl TaskOutcome {
    /// Classification used when this outcome is the first fault of a job.
    pub fn fault_class(&self) -> Option<FaultClass> {
        match self {
            TaskOutcome::Success(_) => None,
            TaskOutcome::Failed(failure) => Some(failure.class),
            TaskOutcome::Cancelled => Some(FaultClass::Cancelled),
            TaskOutcome::Interrupted => Some(FaultClass::Interrupted),
        }
    }

    /// Maps a worker's return value, folding cooperative stops into `Interrupted`.
    pub fn from_result(result: Result<usize, TaskFailure>) -> Self {
        match result {
            Ok(written) => TaskOutcome::Success(written),
            Err(failure) if failure.class == FaultClass::Interrupted => TaskOutcome::Interrupted,
            Err(failure) => TaskOutcome::Failed(failure),
        }
    }
}
