//! In-process task queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::QueueError;
use crate::queue::{QueuedTask, TaskQueue};
use crate::types::TaskId;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedTask>,
    claimed: HashMap<TaskId, QueuedTask>,
}

pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
    /// Wakes a waiting consumer when a task is enqueued
    notify: Notify,
    /// Longest time `dequeue` waits for work before returning `None`
    wait: Duration,
}

impl MemoryTaskQueue {
    pub const DEFAULT_WAIT: Duration = Duration::from_millis(250);

    pub fn new() -> Self {
        Self::with_wait(Self::DEFAULT_WAIT)
    }

    pub fn with_wait(wait: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            wait,
        }
    }

    fn try_claim(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock();
        let task = state.pending.pop_front()?;
        state.claimed.insert(task.task_id.clone(), task.clone());
        Some(task)
    }

    pub fn claimed_len(&self) -> usize {
        self.state.lock().claimed.len()
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError> {
        let queue_size = {
            let mut state = self.state.lock();
            state.pending.push_back(task.clone());
            state.pending.len()
        };
        self.notify.notify_one();
        debug!(task_id = %task.task_id, user_id = %task.user_id, queue_size, "Enqueued generation task");
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<QueuedTask>, QueueError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(task) = self.try_claim() {
            return Ok(Some(task));
        }
        if self.wait.is_zero() {
            return Ok(None);
        }

        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // A task may have landed between the first check and registering for wakeups.
        if let Some(task) = self.try_claim() {
            return Ok(Some(task));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = &mut notified => {}
            _ = tokio::time::sleep(self.wait) => {}
        }

        if cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(self.try_claim())
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), QueueError> {
        self.state.lock().claimed.remove(task_id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().pending.len())
    }

    async fn contains(&self, task_id: &str) -> Result<bool, QueueError> {
        let state = self.state.lock();
        Ok(state.claimed.contains_key(task_id)
            || state.pending.iter().any(|t| t.task_id == task_id))
    }

    async fn drain_claimed(&self) -> Result<Vec<QueuedTask>, QueueError> {
        let mut state = self.state.lock();
        let mut drained: Vec<QueuedTask> = state.claimed.drain().map(|(_, t)| t).collect();
        drained.sort_by_key(|t| t.enqueued_at);
        Ok(drained)
    }
}
