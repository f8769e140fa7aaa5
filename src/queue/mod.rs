//! Task Queue
//!
//! FIFO store of pending generation tasks. Dequeue is destructive: a dequeued task is
//! moved to the claimed set and is never handed out again. `complete_task` clears the
//! claim once execution is over, whatever its outcome.

pub mod memory;
pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::types::{GenerationRequest, TaskId, UserId};

pub use memory::MemoryTaskQueue;
pub use store::SledTaskQueue;

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub request: GenerationRequest,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTask {
    pub fn new(task_id: TaskId, user_id: UserId, request: GenerationRequest) -> Self {
        Self {
            task_id,
            user_id,
            request,
            enqueued_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task. Duplicates are not rejected.
    async fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError>;

    /// Remove and return the oldest pending task.
    ///
    /// Waits a bounded time for work to arrive and returns `None` if none did. Returns
    /// `None` without dequeuing as soon as `cancel` fires.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<QueuedTask>, QueueError>;

    /// Clear the claim for a dequeued task. No-op when there is none.
    async fn complete_task(&self, task_id: &str) -> Result<(), QueueError>;

    /// Number of pending tasks.
    async fn len(&self) -> Result<usize, QueueError>;

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Whether the task is pending or claimed.
    async fn contains(&self, task_id: &str) -> Result<bool, QueueError>;

    /// Take every outstanding claim, typically ones left by a process that stopped
    /// before finishing them.
    async fn drain_claimed(&self) -> Result<Vec<QueuedTask>, QueueError>;
}
