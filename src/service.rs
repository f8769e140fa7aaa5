//! Generation Service
//!
//! Entry point for callers. Small requests run inline and return their questions;
//! larger ones get a `pending` progress record and a queue entry, and the caller polls
//! for progress by task id.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::executor::GenerationExecutor;
use crate::progress::{GenerationProgress, ProgressStore};
use crate::queue::{QueuedTask, TaskQueue};
use crate::types::{new_task_id, GeneratedQuestion, GenerationRequest, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Requests with fewer questions than this run inline
    pub sync_threshold: u32,
    /// Largest accepted `count`
    pub max_count: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sync_threshold: 10,
            max_count: 500,
        }
    }
}

/// What `generate` did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateOutcome {
    Completed(Vec<GeneratedQuestion>),
    Queued(TaskId),
}

pub struct GenerationService {
    queue: Arc<dyn TaskQueue>,
    progress: Arc<dyn ProgressStore>,
    executor: Arc<GenerationExecutor>,
    config: ServiceConfig,
    cancel: CancellationToken,
}

impl GenerationService {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        progress: Arc<dyn ProgressStore>,
        executor: Arc<GenerationExecutor>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            queue,
            progress,
            executor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by inline generation backoffs.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> ServiceConfig {
        self.config
    }

    pub fn validate(&self, request: &GenerationRequest) -> Result<(), GenerationError> {
        if request.topic.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "topic cannot be empty".to_string(),
            ));
        }
        if request.question_types.is_empty() {
            return Err(GenerationError::InvalidRequest(
                "at least one question type is required".to_string(),
            ));
        }
        if request.count == 0 || request.count > self.config.max_count {
            return Err(GenerationError::InvalidRequest(format!(
                "count must be between 1 and {}, got {}",
                self.config.max_count, request.count
            )));
        }
        Ok(())
    }

    pub fn runs_inline(&self, request: &GenerationRequest) -> bool {
        request.count < self.config.sync_threshold
    }

    /// Generate and persist inline. No queue entry and no progress record.
    pub async fn generate_sync(
        &self,
        user_id: &str,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedQuestion>, GenerationError> {
        self.validate(request)?;
        if !self.runs_inline(request) {
            return Err(GenerationError::InvalidRequest(format!(
                "count {} is not below the synchronous threshold {}",
                request.count, self.config.sync_threshold
            )));
        }
        debug!(user_id, count = request.count, "Generating inline");
        self.executor
            .generate_inline(user_id, request, &self.cancel)
            .await
    }

    /// Record `pending`, enqueue, and hand back the task id.
    pub async fn start_async(
        &self,
        user_id: &str,
        request: &GenerationRequest,
    ) -> Result<TaskId, GenerationError> {
        self.validate(request)?;
        let task_id = new_task_id();
        let record = GenerationProgress::pending(task_id.clone(), user_id, request.count);
        self.progress.set(&task_id, &record, None)?;

        let task = QueuedTask::new(task_id.clone(), user_id.to_string(), request.clone());
        if let Err(err) = self.queue.enqueue(task).await {
            if let Err(cleanup) = self.progress.remove(&task_id) {
                warn!(task_id = %task_id, error = %cleanup, "Failed to remove orphaned progress record");
            }
            return Err(err.into());
        }

        info!(
            task_id = %task_id,
            user_id,
            count = request.count,
            "Generation task queued"
        );
        Ok(task_id)
    }

    /// Progress for a task, `None` when it does not exist or belongs to someone else.
    pub fn get_progress(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<GenerationProgress>, GenerationError> {
        progress_for_user(self.progress.as_ref(), user_id, task_id)
    }

    /// Inline below the threshold, queued otherwise.
    pub async fn generate(
        &self,
        user_id: &str,
        request: &GenerationRequest,
    ) -> Result<GenerateOutcome, GenerationError> {
        if self.runs_inline(request) {
            self.generate_sync(user_id, request)
                .await
                .map(GenerateOutcome::Completed)
        } else {
            self.start_async(user_id, request)
                .await
                .map(GenerateOutcome::Queued)
        }
    }
}

/// Ownership-scoped progress lookup behind [`GenerationService::get_progress`]. Callers
/// that only hold a store, such as the CLI, use it directly.
pub fn progress_for_user(
    store: &dyn ProgressStore,
    user_id: &str,
    task_id: &str,
) -> Result<Option<GenerationProgress>, GenerationError> {
    Ok(store
        .get(task_id)?
        .filter(|record| record.user_id == user_id))
}
