//! Progress Store
//!
//! Key/value store of per-task progress records. Every backend provides an atomic
//! read-modify-write [`ProgressStore::update`]: concurrent updates to the same key are
//! applied one after another, never interleaved on stale data.

pub mod memory;
pub mod record;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StorageError;

pub use memory::MemoryProgressStore;
pub use record::{GenerationProgress, ProgressReport, ProgressStatus, TransitionError};
pub use store::SledProgressStore;

/// Pure function from the current record to its replacement. May be invoked more
/// than once for a single update when a backend retries on contention.
pub type ProgressMutator<'a> = &'a (dyn Fn(&GenerationProgress) -> GenerationProgress + Send + Sync);

/// Receives executor progress observations.
pub type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;

pub trait ProgressStore: Send + Sync {
    /// Current record, `None` if absent or expired.
    fn get(&self, task_id: &str) -> Result<Option<GenerationProgress>, StorageError>;

    /// Upsert with optional expiry.
    fn set(
        &self,
        task_id: &str,
        progress: &GenerationProgress,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Atomically replace the record with `mutator(current)`.
    ///
    /// A missing or expired record is replaced by a fresh `pending` one before the
    /// mutator runs. Any existing expiry is preserved.
    fn update(
        &self,
        task_id: &str,
        mutator: ProgressMutator<'_>,
    ) -> Result<GenerationProgress, StorageError>;

    fn remove(&self, task_id: &str) -> Result<(), StorageError>;

    /// Set the expiry of an existing record. Returns false when there is no record.
    fn expire(&self, task_id: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Delete every record past its expiry.
    fn purge_expired(&self) -> Result<usize, StorageError>;

    /// All live records.
    fn list(&self) -> Result<Vec<GenerationProgress>, StorageError>;

    fn list_for_user(&self, user_id: &str) -> Result<Vec<GenerationProgress>, StorageError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect())
    }

    /// Delete failed records that finished more than `max_age` ago.
    fn prune_failed(&self, max_age: Duration) -> Result<usize, StorageError> {
        let now_ms = now_millis() as i64;
        let max_age_ms = max_age.as_millis().min(i64::MAX as u128) as i64;
        let mut removed = 0usize;
        for record in self.list()? {
            if record.status != ProgressStatus::Failed {
                continue;
            }
            let ended_ms = record
                .completed_at
                .unwrap_or(record.updated_at)
                .timestamp_millis();
            if now_ms.saturating_sub(ended_ms) > max_age_ms {
                self.remove(&record.task_id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Stored envelope: record plus optional absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredProgress {
    pub record: GenerationProgress,
    pub expires_at_ms: Option<u64>,
}

impl StoredProgress {
    pub fn new(record: GenerationProgress, ttl: Option<Duration>) -> Self {
        Self {
            record,
            expires_at_ms: ttl.map(expiry_from_now),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub(crate) fn expiry_from_now(ttl: Duration) -> u64 {
    now_millis().saturating_add(ttl.as_millis().min(u64::MAX as u128) as u64)
}

/// Adapt a store into an executor callback.
///
/// Each report becomes one atomic `update`. A report the record refuses (for example
/// one arriving after a terminal status) leaves the record untouched and is logged;
/// store failures are logged too, never propagated into the task.
pub fn store_progress_callback(store: Arc<dyn ProgressStore>) -> ProgressCallback {
    Arc::new(move |report: ProgressReport| {
        let result = store.update(&report.task_id, &|current: &GenerationProgress| {
            current
                .apply_report(&report)
                .unwrap_or_else(|_| current.clone())
        });
        match result {
            Ok(stored) => {
                if stored.status != report.status || stored.generated_count != report.generated
                {
                    warn!(
                        task_id = %report.task_id,
                        stored_status = %stored.status,
                        reported_status = %report.status,
                        "Progress report rejected by record transition rules"
                    );
                }
            }
            Err(err) => {
                warn!(
                    task_id = %report.task_id,
                    status = %report.status,
                    error = %err,
                    "Failed to write progress update"
                );
            }
        }
    })
}
