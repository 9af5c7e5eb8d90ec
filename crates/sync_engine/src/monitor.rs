//! Fault monitor and rollback strategies.
//!
//! Every task outcome of a job passes through one `FaultMonitor`. The first
//! non-success outcome cancels the job's token, which stops the pool and the
//! page loop. Once the pool has drained, `conclude` applies the job's
//! rollback strategy to the cache and hands back the fault.
//!
//! Workers abandoned after the cancellation grace period keep running on
//! their blocking threads. Their cache writes go through the monitor's
//! `WriteFence`, which `conclude` closes before rolling back: a write already
//! in progress finishes first and is rolled back with the rest, a later one
//! is refused.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use sync_core::{FaultClass, RollbackScope, TaskFailure, TaskId, TaskOutcome, Timestamp};
use sync_logging::{sync_error, sync_warn};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, CacheStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReport {
    pub removed: usize,
}

/// What to delete from the cache after a fault.
pub trait RollbackStrategy: Send + Sync {
    fn describe(&self) -> String;
    fn rollback(&self, cache: &CacheStore) -> Result<RollbackReport, CacheError>;
}

/// From-scratch jobs: the collection's cache is not a baseline yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct WipeAll;

impl RollbackStrategy for WipeAll {
    fn describe(&self) -> String {
        "wipe entire collection".to_string()
    }

    fn rollback(&self, cache: &CacheStore) -> Result<RollbackReport, CacheError> {
        let removed = cache.remove_all()?;
        Ok(RollbackReport { removed })
    }
}

/// Incremental jobs: only entries written after the last clean run are suspect.
#[derive(Debug, Clone, Copy)]
pub struct WipeNewerThan(pub Timestamp);

impl RollbackStrategy for WipeNewerThan {
    fn describe(&self) -> String {
        format!("wipe entries modified after {}", self.0)
    }

    fn rollback(&self, cache: &CacheStore) -> Result<RollbackReport, CacheError> {
        let removed = cache.remove_modified_after(self.0)?;
        Ok(RollbackReport { removed })
    }
}

pub fn strategy_for(scope: RollbackScope) -> Arc<dyn RollbackStrategy> {
    match scope {
        RollbackScope::WipeAll => Arc::new(WipeAll),
        RollbackScope::NewerThan(since) => Arc::new(WipeNewerThan(since)),
    }
}

/// A job-ending fault, after its rollback was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub class: FaultClass,
    pub message: String,
    pub rollback: Result<RollbackReport, String>,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)?;
        match &self.rollback {
            Ok(report) => write!(f, " (rolled back {} cache entries)", report.removed),
            Err(err) => write!(f, " (rollback failed: {err})"),
        }
    }
}

impl std::error::Error for Fault {}

/// Outcome counts of one job.
/// Admits cache writes until the job's rollback starts.
#[derive(Debug, Default)]
pub struct WriteFence {
    closed: RwLock<bool>,
}

impl WriteFence {
    /// Run `write` unless the fence is closed. The fence cannot close while it runs.
    pub fn admit<T>(&self, write: impl FnOnce() -> T) -> Option<T> {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return None;
        }
        Some(write())
    }

    /// Refuse further writes. Waits for admitted writes to finish.
    pub fn close(&self) {
        *self.closed.write().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorSummary {
    pub succeeded: usize,
    pub records: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub interrupted: usize,
}

#[derive(Default)]
struct MonitorState {
    first_fault: Option<TaskFailure>,
    summary: MonitorSummary,
}

pub struct FaultMonitor {
    strategy: Arc<dyn RollbackStrategy>,
    cancel: CancellationToken,
    fence: Arc<WriteFence>,
    state: Mutex<MonitorState>,
}

impl FaultMonitor {
    pub fn new(strategy: Arc<dyn RollbackStrategy>) -> Self {
        Self {
            strategy,
            cancel: CancellationToken::new(),
            fence: Arc::new(WriteFence::default()),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Token cancelled on the first fault. Shared with the pool and the page loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fence every cache write of the job must pass.
    pub fn write_fence(&self) -> Arc<WriteFence> {
        self.fence.clone()
    }

    pub fn has_fault(&self) -> bool {
        self.lock().first_fault.is_some()
    }

    pub fn summary(&self) -> MonitorSummary {
        self.lock().summary
    }

    /// Consume one task outcome.
    pub fn observe(&self, task_id: TaskId, outcome: TaskOutcome) {
        let failure = {
            let mut state = self.lock();
            match &outcome {
                TaskOutcome::Success(records) => {
                    state.summary.succeeded += 1;
                    state.summary.records += records;
                }
                TaskOutcome::Failed(_) => state.summary.failed += 1,
                TaskOutcome::Cancelled => state.summary.cancelled += 1,
                TaskOutcome::Interrupted => state.summary.interrupted += 1,
            }
            let Some(class) = outcome.fault_class() else {
                return;
            };
            if state.first_fault.is_some() {
                return;
            }
            let failure = match outcome {
                TaskOutcome::Failed(failure) => failure,
                _ => TaskFailure::new(class, format!("task {task_id} did not finish")),
            };
            state.first_fault = Some(failure.clone());
            failure
        };
        sync_error!("task {} failed, stopping job: {}", task_id, failure);
        self.cancel.cancel();
    }

    /// Report a fault raised outside the pool, e.g. by a page fetch.
    pub fn record_failure(&self, failure: TaskFailure) {
        {
            let mut state = self.lock();
            if state.first_fault.is_some() {
                return;
            }
            state.first_fault = Some(failure.clone());
        }
        sync_error!("job failed, stopping: {}", failure);
        self.cancel.cancel();
    }

    /// Finish the job: the summary if clean, otherwise roll back and return the fault.
    ///
    /// Call only after the pool has drained.
    pub fn conclude(&self, cache: &CacheStore) -> Result<MonitorSummary, Fault> {
        let (first_fault, summary) = {
            let state = self.lock();
            (state.first_fault.clone(), state.summary)
        };
        let Some(failure) = first_fault else {
            return Ok(summary);
        };

        self.fence.close();
        sync_warn!(
            "rolling back {:?}: {}",
            cache.dir(),
            self.strategy.describe()
        );
        let rollback = match self.strategy.rollback(cache) {
            Ok(report) => {
                sync_warn!("rollback removed {} cache entries", report.removed);
                Ok(report)
            }
            Err(err) => {
                sync_error!("rollback of {:?} failed: {}", cache.dir(), err);
                Err(err.to_string())
            }
        };
        Err(Fault {
            class: failure.class,
            message: failure.message,
            rollback,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sync_core::{FaultClass, TaskFailure, TaskOutcome};
    use tempfile::TempDir;

    use super::{FaultMonitor, WipeAll, WriteFence};
    use crate::cache::CacheStore;

    #[test]
    fn first_failure_wins_and_cancels() {
        let monitor = FaultMonitor::new(Arc::new(WipeAll));
        let token = monitor.cancel_token();

        monitor.observe(1, TaskOutcome::Success(3));
        assert!(!token.is_cancelled());

        monitor.observe(2, TaskOutcome::Failed(TaskFailure::malformed("bad id")));
        monitor.observe(3, TaskOutcome::Failed(TaskFailure::generic("later")));
        monitor.observe(4, TaskOutcome::Cancelled);
        assert!(token.is_cancelled());

        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path(), "contacts");
        let fault = monitor.conclude(&cache).unwrap_err();
        assert_eq!(fault.class, FaultClass::MalformedInput);
        assert_eq!(fault.message, "bad id");

        let summary = monitor.summary();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.records, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.cancelled, 1);
    }

    #[test]
    fn clean_job_concludes_without_touching_cache() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path(), "contacts");
        cache.write(7, &serde_json::json!({"id": 7})).unwrap();

        let monitor = FaultMonitor::new(Arc::new(WipeAll));
        monitor.observe(1, TaskOutcome::Success(1));
        let summary = monitor.conclude(&cache).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(cache.ids().unwrap(), vec![7]);
    }

    #[test]
    fn interrupted_first_outcome_is_classified() {
        let monitor = FaultMonitor::new(Arc::new(WipeAll));
        monitor.observe(9, TaskOutcome::Interrupted);
        let temp = TempDir::new().unwrap();
        let fault = monitor
            .conclude(&CacheStore::new(temp.path(), "deals"))
            .unwrap_err();
        assert_eq!(fault.class, FaultClass::Interrupted);
    }

    #[test]
    fn closed_fence_refuses_writes() {
        let fence = WriteFence::default();
        assert_eq!(fence.admit(|| 1), Some(1));
        fence.close();
        assert!(fence.is_closed());
        assert_eq!(fence.admit(|| 2), None);
    }

    #[test]
    fn rollback_closes_the_fence_but_a_clean_job_does_not() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path(), "contacts");

        let clean = FaultMonitor::new(Arc::new(WipeAll));
        clean.conclude(&cache).unwrap();
        assert!(!clean.write_fence().is_closed());

        let failed = FaultMonitor::new(Arc::new(WipeAll));
        failed.record_failure(TaskFailure::generic("boom"));
        failed.conclude(&cache).unwrap_err();
        assert!(failed.write_fence().is_closed());
    }
}
