//! Adaptive worker pool with a bounded backlog.
//!
//! Tasks wait in a bounded queue and run on blocking worker threads, at most
//! `ConcurrencyLimit::max()` at a time. The limit can be changed while the
//! pool runs; shrinking takes effect as running tasks finish. When the
//! backlog is full, `submit` waits for room instead of rejecting the task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sync_core::{TaskFailure, TaskId, TaskOutcome};
use sync_logging::{sync_debug, sync_error, sync_warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::monitor::{FaultMonitor, WriteFence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Initial concurrency ceiling; `None` means host parallelism.
    pub core_size: Option<usize>,
    /// How long running tasks may keep going after a fault before they are abandoned.
    pub cancel_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            core_size: None,
            cancel_grace_ms: 2_000,
        }
    }
}

impl PoolSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool stopped; task not accepted")]
    Stopped,
}

/// Handed to each task body.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    task_id: TaskId,
    cancel: CancellationToken,
    fence: Arc<WriteFence>,
}

impl WorkerContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Task bodies check this between items and return `TaskFailure::interrupted()`.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a persisting step unless the job has started rolling back.
    ///
    /// A task abandoned after the grace period may still get here; its write
    /// is refused with `TaskFailure::interrupted()`.
    pub fn persist<T>(
        &self,
        write: impl FnOnce() -> Result<T, TaskFailure>,
    ) -> Result<T, TaskFailure> {
        self.fence
            .admit(write)
            .unwrap_or_else(|| Err(TaskFailure::interrupted()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub queue_capacity: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub interrupted: u64,
    pub backpressure_waits: u64,
    pub max_concurrency_seen: usize,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    interrupted: AtomicU64,
    backpressure_waits: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl PoolCounters {
    fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Success(_) => &self.succeeded,
            TaskOutcome::Failed(_) => &self.failed,
            TaskOutcome::Cancelled => &self.cancelled,
            TaskOutcome::Interrupted => &self.interrupted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, queue_capacity: usize) -> PoolStats {
        PoolStats {
            queue_capacity,
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            max_concurrency_seen: self.max_active.load(Ordering::Relaxed),
        }
    }
}

struct ActiveGuard<'a>(&'a PoolCounters);

impl<'a> ActiveGuard<'a> {
    fn enter(counters: &'a PoolCounters) -> Self {
        let active = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
        counters.max_active.fetch_max(active, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

struct LimitState {
    max: usize,
    /// Permits that must be retired as they come back, because shrinking
    /// found them checked out.
    debt: usize,
}

/// A concurrency ceiling that can be raised or lowered at runtime.
pub struct ConcurrencyLimit {
    semaphore: Arc<Semaphore>,
    state: Mutex<LimitState>,
}

impl ConcurrencyLimit {
    pub fn new(max: usize) -> Arc<Self> {
        let max = max.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max)),
            state: Mutex::new(LimitState { max, debt: 0 }),
        })
    }

    pub fn max(&self) -> usize {
        self.lock().max
    }

    /// Apply a new ceiling (at least 1) without touching running tasks.
    pub fn set_max(&self, new_max: usize) {
        let new_max = new_max.max(1);
        let mut state = self.lock();
        if new_max > state.max {
            let grow = new_max - state.max;
            let repaid = grow.min(state.debt);
            state.debt -= repaid;
            if grow > repaid {
                self.semaphore.add_permits(grow - repaid);
            }
        } else if new_max < state.max {
            let shrink = state.max - new_max;
            let forgotten = self.semaphore.forget_permits(shrink);
            state.debt += shrink - forgotten;
        }
        state.max = new_max;
    }

    async fn acquire(self: &Arc<Self>) -> Option<LimitPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        Some(LimitPermit {
            permit: Some(permit),
            limit: self.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct LimitPermit {
    permit: Option<OwnedSemaphorePermit>,
    limit: Arc<ConcurrencyLimit>,
}

impl Drop for LimitPermit {
    fn drop(&mut self) {
        let mut state = self.limit.lock();
        if state.debt > 0 {
            state.debt -= 1;
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
        }
    }
}

type Work = Box<dyn FnOnce(&WorkerContext) -> Result<usize, TaskFailure> + Send + 'static>;

struct QueuedTask {
    id: TaskId,
    work: Work,
}

/// Shared by the dispatcher and its tasks.
struct Shared {
    counters: PoolCounters,
    monitor: Arc<FaultMonitor>,
    cancel: CancellationToken,
    /// Tasks dispatched whose outcome is not yet reported.
    unsettled: Mutex<HashSet<TaskId>>,
}

impl Shared {
    fn settle(&self, id: TaskId, outcome: TaskOutcome) {
        self.unsettled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.counters.record(&outcome);
        self.monitor.observe(id, outcome);
    }
}

pub struct AdaptivePool {
    sender: mpsc::Sender<QueuedTask>,
    limit: Arc<ConcurrencyLimit>,
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl AdaptivePool {
    /// Start a pool. Must be called from within a tokio runtime.
    ///
    /// The pool stops when the monitor's token is cancelled.
    pub fn new(
        max_size: usize,
        queue_capacity: usize,
        cancel_grace: Duration,
        monitor: Arc<FaultMonitor>,
    ) -> Self {
        let queue_capacity = queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let limit = ConcurrencyLimit::new(max_size);
        let shared = Arc::new(Shared {
            counters: PoolCounters::default(),
            cancel: monitor.cancel_token(),
            monitor,
            unsettled: Mutex::new(HashSet::new()),
        });
        let dispatcher = tokio::spawn(dispatch(
            receiver,
            limit.clone(),
            shared.clone(),
            cancel_grace,
        ));
        Self {
            sender,
            limit,
            shared,
            dispatcher,
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Live concurrency ceiling, for the governor.
    pub fn limit(&self) -> Arc<ConcurrencyLimit> {
        self.limit.clone()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop accepting work and cancel what has not started.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot(self.queue_capacity)
    }

    /// Queue a task and return its id. Waits while the backlog is full; fails
    /// only once the pool stopped. The outcome goes to the fault monitor.
    pub async fn submit<F>(&self, work: F) -> Result<TaskId, PoolError>
    where
        F: FnOnce(&WorkerContext) -> Result<usize, TaskFailure> + Send + 'static,
    {
        if self.shared.cancel.is_cancelled() {
            return Err(PoolError::Stopped);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = QueuedTask {
            id,
            work: Box::new(work),
        };

        match self.sender.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                self.shared
                    .counters
                    .backpressure_waits
                    .fetch_add(1, Ordering::Relaxed);
                sync_debug!(
                    "backlog full ({} queued), task {} waits for room",
                    self.queue_capacity,
                    id
                );
                tokio::select! {
                    sent = self.sender.send(task) => sent.map_err(|_| PoolError::Stopped)?,
                    () = self.shared.cancel.cancelled() => return Err(PoolError::Stopped),
                }
            }
            Err(TrySendError::Closed(_)) => return Err(PoolError::Stopped),
        }

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Close the backlog and wait until every submitted task has reported.
    pub async fn finish(self) -> PoolStats {
        let Self {
            sender,
            shared,
            dispatcher,
            queue_capacity,
            ..
        } = self;
        drop(sender);
        if let Err(err) = dispatcher.await {
            sync_error!("pool dispatcher ended abnormally: {}", err);
            shared.cancel.cancel();
        }
        shared.counters.snapshot(queue_capacity)
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<QueuedTask>,
    limit: Arc<ConcurrencyLimit>,
    shared: Arc<Shared>,
    cancel_grace: Duration,
) {
    let cancel = shared.cancel.clone();
    let mut running = JoinSet::new();

    loop {
        // Take a worker slot first so the backlog stays queued while all workers are busy.
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = limit.acquire() => match permit {
                Some(permit) => permit,
                None => break,
            },
        };
        let task = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            task = receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        shared
            .unsettled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id);
        running.spawn(run_task(task, permit, shared.clone()));
        while running.try_join_next().is_some() {}
    }

    receiver.close();
    while let Ok(task) = receiver.try_recv() {
        shared.settle(task.id, TaskOutcome::Cancelled);
    }

    drain(&mut running, &cancel, cancel_grace).await;

    let abandoned: Vec<TaskId> = shared
        .unsettled
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for id in abandoned {
        shared.counters.record(&TaskOutcome::Interrupted);
        shared.monitor.observe(id, TaskOutcome::Interrupted);
    }
}

/// Wait for running tasks; once cancelled, give them `grace` before aborting.
async fn drain(running: &mut JoinSet<()>, cancel: &CancellationToken, grace: Duration) {
    let mut deadline: Option<Instant> = None;
    let mut aborted = false;
    loop {
        let armed = if aborted { None } else { deadline };
        tokio::select! {
            joined = running.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            () = cancel.cancelled(), if deadline.is_none() => {
                deadline = Some(Instant::now() + grace);
            }
            () = grace_elapsed(armed) => {
                sync_warn!(
                    "{} tasks still running {:?} after cancellation, abandoning them",
                    running.len(),
                    grace
                );
                running.abort_all();
                aborted = true;
            }
        }
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_task(task: QueuedTask, permit: LimitPermit, shared: Arc<Shared>) {
    let QueuedTask { id, work } = task;
    let outcome = if shared.cancel.is_cancelled() {
        TaskOutcome::Cancelled
    } else {
        let _active = ActiveGuard::enter(&shared.counters);
        let ctx = WorkerContext {
            task_id: id,
            cancel: shared.cancel.clone(),
            fence: shared.monitor.write_fence(),
        };
        match tokio::task::spawn_blocking(move || work(&ctx)).await {
            Ok(result) => TaskOutcome::from_result(result),
            Err(err) if err.is_panic() => TaskOutcome::Failed(TaskFailure::generic(format!(
                "worker for task {id} panicked"
            ))),
            Err(_) => TaskOutcome::Interrupted,
        }
    };
    drop(permit);
    shared.settle(id, outcome);
}
