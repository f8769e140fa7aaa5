//! Progress record and its status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{TaskId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PartialSuccess,
}

impl ProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Processing => "processing",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::PartialSuccess => "partial_success",
        }
    }

    /// Terminal statuses are sinks.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::PartialSuccess
        )
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Task {task_id} is already {from}; cannot move to {to}")]
    TerminalStatus {
        task_id: TaskId,
        from: ProgressStatus,
        to: ProgressStatus,
    },

    #[error("Task {task_id} cannot move back from {from} to {to}")]
    Backwards {
        task_id: TaskId,
        from: ProgressStatus,
        to: ProgressStatus,
    },

    #[error("Task {task_id} generated count {generated} exceeds total {total}")]
    CountOutOfRange {
        task_id: TaskId,
        generated: u32,
        total: u32,
    },

    #[error("Task {task_id} cannot complete with {generated} of {total} questions")]
    IncompleteCompletion {
        task_id: TaskId,
        generated: u32,
        total: u32,
    },
}

/// A progress observation produced by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub task_id: TaskId,
    pub generated: u32,
    pub total: u32,
    pub status: ProgressStatus,
    pub error_message: Option<String>,
}

/// Mutable status record, one per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProgress {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub status: ProgressStatus,
    pub generated_count: u32,
    pub total_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationProgress {
    pub fn pending(task_id: impl Into<TaskId>, user_id: impl Into<UserId>, total_count: u32) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
            status: ProgressStatus::Pending,
            generated_count: 0,
            total_count,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Produce the record that results from applying `report`.
    ///
    /// Rejects any move out of a terminal status, any move back to `pending`, counts
    /// above the total, and `completed` without every question generated.
    pub fn apply_report(&self, report: &ProgressReport) -> Result<Self, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::TerminalStatus {
                task_id: self.task_id.clone(),
                from: self.status,
                to: report.status,
            });
        }
        if report.status == ProgressStatus::Pending && self.status != ProgressStatus::Pending {
            return Err(TransitionError::Backwards {
                task_id: self.task_id.clone(),
                from: self.status,
                to: report.status,
            });
        }
        if report.generated > report.total {
            return Err(TransitionError::CountOutOfRange {
                task_id: self.task_id.clone(),
                generated: report.generated,
                total: report.total,
            });
        }
        if report.status == ProgressStatus::Completed && report.generated != report.total {
            return Err(TransitionError::IncompleteCompletion {
                task_id: self.task_id.clone(),
                generated: report.generated,
                total: report.total,
            });
        }

        let now = Utc::now();
        let mut next = self.clone();
        next.status = report.status;
        next.generated_count = report.generated;
        next.total_count = report.total;
        next.updated_at = now;
        next.error_message = if report.status == ProgressStatus::Failed {
            Some(
                report
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "generation failed".to_string()),
            )
        } else {
            None
        };
        if report.status.is_terminal() {
            next.completed_at = Some(now);
        }
        Ok(next)
    }

    /// Terminal failure keeping whatever count was recorded so far.
    pub fn fail(&self, message: impl Into<String>) -> Result<Self, TransitionError> {
        self.apply_report(&ProgressReport {
            task_id: self.task_id.clone(),
            generated: self.generated_count,
            total: self.total_count,
            status: ProgressStatus::Failed,
            error_message: Some(message.into()),
        })
    }
}
