//! Generation Executor
//!
//! Runs one generation task: splits the requested count into batches, asks the provider
//! for each batch in turn, persists every batch, and reports progress after each one.
//! The terminal status follows from how many questions were persisted, never from
//! which error ended the run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::progress::{ProgressCallback, ProgressReport, ProgressStatus};
use crate::provider::{GenerationPrompt, QuestionProvider};
use crate::repository::QuestionRepository;
use crate::types::{GeneratedQuestion, GenerationRequest};

/// Error recorded on a task that shutdown cut short.
pub const CANCELLED_MESSAGE: &str = "cancelled by shutdown";

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ProgressStatus,
    pub generated: u32,
    pub total: u32,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// Whether completion side effects should run for this task.
    pub fn should_cleanup(&self) -> bool {
        matches!(
            self.status,
            ProgressStatus::Completed | ProgressStatus::PartialSuccess
        )
    }

    /// True when shutdown, not the provider, ended the run.
    pub fn was_cancelled(&self) -> bool {
        self.error.as_deref() == Some(CANCELLED_MESSAGE)
    }

    fn conclude(total: u32, generated: u32, failure: Option<&GenerationError>) -> Self {
        let error = failure.map(|err| {
            if err.is_cancellation() {
                CANCELLED_MESSAGE.to_string()
            } else {
                err.to_string()
            }
        });
        if generated == 0 {
            return Self {
                status: ProgressStatus::Failed,
                generated,
                total,
                error: Some(error.unwrap_or_else(|| "provider produced no questions".to_string())),
            };
        }
        let status = if failure.is_none() && generated == total {
            ProgressStatus::Completed
        } else {
            ProgressStatus::PartialSuccess
        };
        Self {
            status,
            generated,
            total,
            error,
        }
    }
}

/// Batch sizes covering `total`: full batches then the remainder.
pub fn batch_sizes(total: u32, batch_size: u32) -> Vec<u32> {
    let batch_size = batch_size.max(1);
    let mut sizes = Vec::with_capacity((total / batch_size + 1) as usize);
    let mut remaining = total;
    while remaining > 0 {
        let size = remaining.min(batch_size);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

pub struct GenerationExecutor {
    provider: Arc<dyn QuestionProvider>,
    repository: Arc<dyn QuestionRepository>,
    batch_size: u32,
}

impl GenerationExecutor {
    pub const DEFAULT_BATCH_SIZE: u32 = 10;

    pub fn new(provider: Arc<dyn QuestionProvider>, repository: Arc<dyn QuestionRepository>) -> Self {
        Self {
            provider,
            repository,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// One provider call plus persistence. Returns what was persisted.
    async fn run_batch(
        &self,
        user_id: &str,
        request: &GenerationRequest,
        count: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedQuestion>, GenerationError> {
        let prompt = GenerationPrompt::for_batch(request, count);
        let mut questions = self.provider.generate(&prompt, cancel).await?;
        if questions.is_empty() {
            return Err(GenerationError::ProviderError(format!(
                "{} returned no questions",
                self.provider.provider_name()
            )));
        }
        if questions.len() > count as usize {
            debug!(
                requested = count,
                returned = questions.len(),
                "Truncating oversized provider batch"
            );
            questions.truncate(count as usize);
        }
        self.repository
            .persist(user_id, request.question_bank_id.as_deref(), &questions)
            .await?;
        Ok(questions)
    }

    /// Run a queued task to a terminal status.
    ///
    /// Progress goes to `progress`: `processing` before the first provider call, again
    /// after every persisted batch, then the terminal status.
    pub async fn execute(
        &self,
        task_id: &str,
        user_id: &str,
        request: &GenerationRequest,
        progress: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let total = request.count;
        let report = |generated: u32, status: ProgressStatus, error_message: Option<String>| {
            progress(ProgressReport {
                task_id: task_id.to_string(),
                generated,
                total,
                status,
                error_message,
            })
        };

        report(0, ProgressStatus::Processing, None);
        info!(
            task_id,
            user_id,
            total,
            provider = self.provider.provider_name(),
            "Generation started"
        );

        let mut generated: u32 = 0;
        let mut failure: Option<GenerationError> = None;
        for (index, size) in batch_sizes(total, self.batch_size).into_iter().enumerate() {
            match self.run_batch(user_id, request, size, cancel).await {
                Ok(questions) => {
                    generated = generated.saturating_add(questions.len() as u32).min(total);
                    debug!(task_id, batch = index + 1, generated, total, "Batch persisted");
                    report(generated, ProgressStatus::Processing, None);
                }
                Err(err) => {
                    warn!(
                        task_id,
                        batch = index + 1,
                        generated,
                        error = %err,
                        "Batch failed, stopping generation"
                    );
                    failure = Some(err);
                    break;
                }
            }
        }

        let outcome = ExecutionOutcome::conclude(total, generated, failure.as_ref());
        report(outcome.generated, outcome.status, outcome.error.clone());
        match outcome.status {
            ProgressStatus::Failed => warn!(
                task_id,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Generation failed"
            ),
            status => info!(task_id, %status, generated, total, "Generation finished"),
        }
        outcome
    }

    /// Synchronous path: same batching and persistence, no progress record. The first
    /// error is returned as is.
    pub async fn generate_inline(
        &self,
        user_id: &str,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedQuestion>, GenerationError> {
        let mut questions = Vec::with_capacity(request.count as usize);
        for size in batch_sizes(request.count, self.batch_size) {
            questions.extend(self.run_batch(user_id, request, size, cancel).await?);
        }
        Ok(questions)
    }
}
