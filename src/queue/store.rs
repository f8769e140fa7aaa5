//! Durable sled-backed task queue.

use std::time::Duration;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, IVec, Transactional, Tree};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{json_to_storage, sled_to_storage, QueueError, StorageError};
use crate::queue::{QueuedTask, TaskQueue};

const TREE_PENDING: &str = "task_queue_pending";
const TREE_CLAIMED: &str = "task_queue_claimed";

/// Pending tasks are keyed by a big-endian id from `Db::generate_id`, which is
/// monotonic, so key order is enqueue order. Claims are keyed by task id. Moving a
/// task from pending to claimed happens in one transaction across both trees.
pub struct SledTaskQueue {
    db: Db,
    pending: Tree,
    claimed: Tree,
    notify: Notify,
    wait: Duration,
}

impl SledTaskQueue {
    pub const DEFAULT_WAIT: Duration = Duration::from_millis(250);

    pub fn new(db: Db) -> Result<Self, StorageError> {
        Self::with_wait(db, Self::DEFAULT_WAIT)
    }

    pub fn with_wait(db: Db, wait: Duration) -> Result<Self, StorageError> {
        let pending = db.open_tree(TREE_PENDING).map_err(sled_to_storage)?;
        let claimed = db.open_tree(TREE_CLAIMED).map_err(sled_to_storage)?;
        Ok(Self {
            db,
            pending,
            claimed,
            notify: Notify::new(),
            wait,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn decode(raw: &[u8]) -> Result<QueuedTask, StorageError> {
        serde_json::from_slice(raw).map_err(json_to_storage)
    }

    fn try_claim(&self) -> Result<Option<QueuedTask>, StorageError> {
        loop {
            let Some((key, value)) = self.pending.first().map_err(sled_to_storage)? else {
                return Ok(None);
            };
            let task = match Self::decode(&value) {
                Ok(task) => task,
                Err(err) => {
                    // An undecodable entry would block the head of the queue forever.
                    warn!(error = %err, "Dropping undecodable queue entry");
                    self.pending.remove(&key).map_err(sled_to_storage)?;
                    continue;
                }
            };

            let moved: Result<Option<IVec>, TransactionError<()>> = (&self.pending, &self.claimed)
                .transaction(|(pending, claimed)| -> ConflictableTransactionResult<Option<IVec>, ()> {
                    let removed = pending.remove(key.clone())?;
                    if let Some(raw) = &removed {
                        claimed.insert(task.task_id.as_bytes(), raw.clone())?;
                    }
                    Ok(removed)
                });

            match moved {
                Ok(Some(_)) => return Ok(Some(task)),
                // Someone else took this entry; look at the new head.
                Ok(None) => continue,
                Err(TransactionError::Storage(err)) => return Err(sled_to_storage(err)),
                Err(TransactionError::Abort(())) => continue,
            }
        }
    }
}

#[async_trait]
impl TaskQueue for SledTaskQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError> {
        let id = self.db.generate_id().map_err(sled_to_storage)?;
        let value = serde_json::to_vec(&task).map_err(json_to_storage)?;
        self.pending
            .insert(id.to_be_bytes(), value)
            .map_err(sled_to_storage)?;
        self.notify.notify_one();
        debug!(task_id = %task.task_id, user_id = %task.user_id, "Enqueued generation task");
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<QueuedTask>, QueueError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(task) = self.try_claim()? {
            return Ok(Some(task));
        }
        if self.wait.is_zero() {
            return Ok(None);
        }

        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if let Some(task) = self.try_claim()? {
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
        Ok(self.try_claim()?)
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), QueueError> {
        self.claimed
            .remove(task_id.as_bytes())
            .map_err(sled_to_storage)?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.pending.len())
    }

    async fn contains(&self, task_id: &str) -> Result<bool, QueueError> {
        if self
            .claimed
            .contains_key(task_id.as_bytes())
            .map_err(sled_to_storage)?
        {
            return Ok(true);
        }
        for result in self.pending.iter() {
            let (_, value) = result.map_err(sled_to_storage)?;
            if Self::decode(&value)?.task_id == task_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn drain_claimed(&self) -> Result<Vec<QueuedTask>, QueueError> {
        let mut drained = Vec::new();
        for result in self.claimed.iter() {
            let (key, value) = result.map_err(sled_to_storage)?;
            self.claimed.remove(&key).map_err(sled_to_storage)?;
            match Self::decode(&value) {
                Ok(task) => drained.push(task),
                Err(err) => warn!(error = %err, "Dropping undecodable claim"),
            }
        }
        drained.sort_by_key(|t| t.enqueued_at);
        Ok(drained)
    }
}
