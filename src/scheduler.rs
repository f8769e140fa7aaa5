//! Worker Pool / Scheduler
//!
//! One poll loop feeds a bounded pool of supervised tokio tasks. A concurrency slot is
//! taken before every dequeue, so the queue is never drained faster than there is
//! capacity to run what comes out of it, and a shutdown that arrives while the pool is
//! full leaves every pending task in the queue.
//!
//! Lifecycle: `Running` until the shutdown token fires, then `Draining` while in-flight
//! executions finish, then `Stopped`.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::GenerationError;
use crate::executor::{ExecutionOutcome, GenerationExecutor};
use crate::progress::{store_progress_callback, GenerationProgress, ProgressStore};
use crate::queue::{QueuedTask, TaskQueue};

/// Error recorded on tasks a previous process claimed but never finished.
pub const INTERRUPTED_MESSAGE: &str = "interrupted before completion";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrent executions
    pub worker_concurrency: usize,
    /// Sleep after an empty dequeue
    pub poll_interval: Duration,
    /// Sleep after a queue error
    pub error_backoff: Duration,
    /// How often a drain logs the in-flight count
    pub drain_log_interval: Duration,
    /// Expiry applied to completed and partially successful records
    pub completed_ttl: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_millis(2000),
            drain_log_interval: Duration::from_secs(5),
            completed_ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Draining,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerState::Running => "running",
            SchedulerState::Draining => "draining",
            SchedulerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Held by a dispatched task for its whole lifetime. Dropping it, on any exit path,
/// decrements the in-flight count and then frees the slot.
struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl SlotGuard {
    fn new(permit: OwnedSemaphorePermit, in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            _permit: permit,
            in_flight,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    progress: Arc<dyn ProgressStore>,
    executor: Arc<GenerationExecutor>,
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    tracker: TaskTracker,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        progress: Arc<dyn ProgressStore>,
        executor: Arc<GenerationExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        let concurrency = config.worker_concurrency.max(1);
        let (state, _) = watch::channel(SchedulerState::Running);
        Self {
            queue,
            progress,
            executor,
            config,
            slots: Arc::new(Semaphore::new(concurrency)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            state,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
        debug!(%state, "Scheduler state changed");
    }

    /// Fail every task a previous process dequeued but never finished.
    ///
    /// Claims are cleared and not replayed. Returns how many records were marked failed.
    pub async fn recover_interrupted(&self) -> Result<usize, GenerationError> {
        let claims = self.queue.drain_claimed().await?;
        let mut failed = 0usize;
        for task in claims {
            let user_id = task.user_id.clone();
            let total = task.request.count;
            let record = self.progress.update(&task.task_id, &|current: &GenerationProgress| {
                if current.is_terminal() {
                    return current.clone();
                }
                let mut base = current.clone();
                if base.user_id.is_empty() {
                    base.user_id = user_id.clone();
                    base.total_count = total;
                }
                base.fail(INTERRUPTED_MESSAGE)
                    .unwrap_or_else(|_| current.clone())
            })?;
            if record.error_message.as_deref() == Some(INTERRUPTED_MESSAGE) {
                warn!(task_id = %task.task_id, user_id = %task.user_id, "Marked interrupted task as failed");
                failed += 1;
            }
        }
        if failed > 0 {
            info!(failed, "Recovered interrupted tasks");
        }
        Ok(failed)
    }

    /// Start the poll loop on the runtime.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> SchedulerHandle {
        let scheduler = Arc::clone(self);
        let token = shutdown.clone();
        let state = self.subscribe();
        let join = tokio::spawn(async move { scheduler.run(token).await });
        SchedulerHandle {
            shutdown,
            join,
            state,
        }
    }

    /// Poll until `shutdown` fires, then drain. Returns once `Stopped`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.tracker.reopen();
        self.set_state(SchedulerState::Running);
        info!(
            worker_concurrency = self.config.worker_concurrency.max(1),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.dequeue(&shutdown).await {
                Ok(Some(task)) => self.dispatch(task, permit, shutdown.clone()),
                Ok(None) => {
                    drop(permit);
                    if pause(&shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(err) => {
                    drop(permit);
                    error!(
                        error = %err,
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "Task queue unavailable, backing off"
                    );
                    if pause(&shutdown, self.config.error_backoff).await {
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    fn dispatch(self: &Arc<Self>, task: QueuedTask, permit: OwnedSemaphorePermit, cancel: CancellationToken) {
        let guard = SlotGuard::new(permit, Arc::clone(&self.in_flight));
        let scheduler = Arc::clone(self);
        debug!(task_id = %task.task_id, in_flight = self.in_flight(), "Dispatching task");
        self.tracker.spawn(async move {
            let _guard = guard;
            scheduler.process(task, cancel).await;
        });
    }

    async fn process(&self, task: QueuedTask, cancel: CancellationToken) {
        let callback = store_progress_callback(Arc::clone(&self.progress));
        let execution = self.executor.execute(
            &task.task_id,
            &task.user_id,
            &task.request,
            &callback,
            &cancel,
        );
        let outcome: Option<ExecutionOutcome> =
            match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(outcome) => Some(outcome),
                Err(panic) => {
                    let message = format!("executor panicked: {}", panic_message(panic.as_ref()));
                    error!(task_id = %task.task_id, error = %message, "Task execution panicked");
                    self.mark_failed(&task.task_id, &message);
                    None
                }
            };

        if let Err(err) = self.queue.complete_task(&task.task_id).await {
            error!(task_id = %task.task_id, error = %err, "Failed to clear queue claim");
        }

        let Some(outcome) = outcome else {
            return;
        };
        if !outcome.should_cleanup() {
            return;
        }
        info!(
            task_id = %task.task_id,
            user_id = %task.user_id,
            status = %outcome.status,
            generated = outcome.generated,
            total = outcome.total,
            "Task completed"
        );
        if let Some(ttl) = self.config.completed_ttl {
            if let Err(err) = self.progress.expire(&task.task_id, ttl) {
                warn!(task_id = %task.task_id, error = %err, "Failed to set progress expiry");
            }
        }
    }

    fn mark_failed(&self, task_id: &str, message: &str) {
        let result = self.progress.update(task_id, &|current: &GenerationProgress| {
            current.fail(message).unwrap_or_else(|_| current.clone())
        });
        if let Err(err) = result {
            error!(task_id, error = %err, "Failed to record task failure");
        }
    }

    async fn drain(&self) {
        self.set_state(SchedulerState::Draining);
        self.tracker.close();
        info!(in_flight = self.in_flight(), "Scheduler draining");

        let wait = self.tracker.wait();
        tokio::pin!(wait);
        let mut ticker = tokio::time::interval(self.config.drain_log_interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut wait => break,
                _ = ticker.tick() => {
                    info!(in_flight = self.in_flight(), "Waiting for in-flight tasks");
                }
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!("Scheduler stopped");
    }
}

/// Cancellable sleep. Returns true when cancelled.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Running scheduler.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    state: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Signal shutdown and wait for the drain to finish.
    pub async fn shutdown(self) -> Result<(), GenerationError> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the scheduler to stop without signalling it.
    pub async fn join(self) -> Result<(), GenerationError> {
        self.join
            .await
            .map_err(|e| GenerationError::ConfigError(format!("Scheduler task failed: {}", e)))
    }
}
