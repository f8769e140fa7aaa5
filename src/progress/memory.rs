//! In-process progress store.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::progress::{
    expiry_from_now, now_millis, GenerationProgress, ProgressMutator, ProgressStore,
    StoredProgress,
};

/// Mutex-guarded map. `update` holds the lock across read, mutate and write, so
/// updates are serialized per store.
#[derive(Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<String, StoredProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, task_id: &str) -> Result<Option<GenerationProgress>, StorageError> {
        let now = now_millis();
        let mut records = self.records.lock();
        match records.get(task_id) {
            Some(stored) if stored.is_expired(now) => {
                records.remove(task_id);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.record.clone())),
            None => Ok(None),
        }
    }

    fn set(
        &self,
        task_id: &str,
        progress: &GenerationProgress,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.records
            .lock()
            .insert(task_id.to_string(), StoredProgress::new(progress.clone(), ttl));
        Ok(())
    }

    fn update(
        &self,
        task_id: &str,
        mutator: ProgressMutator<'_>,
    ) -> Result<GenerationProgress, StorageError> {
        let now = now_millis();
        let mut records = self.records.lock();
        let (current, expires_at_ms) = match records.get(task_id) {
            Some(stored) if !stored.is_expired(now) => {
                (stored.record.clone(), stored.expires_at_ms)
            }
            _ => (GenerationProgress::pending(task_id, "", 0), None),
        };
        let next = mutator(&current);
        records.insert(
            task_id.to_string(),
            StoredProgress {
                record: next.clone(),
                expires_at_ms,
            },
        );
        Ok(next)
    }

    fn remove(&self, task_id: &str) -> Result<(), StorageError> {
        self.records.lock().remove(task_id);
        Ok(())
    }

    fn expire(&self, task_id: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = now_millis();
        let mut records = self.records.lock();
        match records.get_mut(task_id) {
            Some(stored) if !stored.is_expired(now) => {
                stored.expires_at_ms = Some(expiry_from_now(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = now_millis();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, stored| !stored.is_expired(now));
        Ok(before - records.len())
    }

    fn list(&self) -> Result<Vec<GenerationProgress>, StorageError> {
        let now = now_millis();
        let records = self.records.lock();
        let mut out: Vec<GenerationProgress> = records
            .values()
            .filter(|stored| !stored.is_expired(now))
            .map(|stored| stored.record.clone())
            .collect();
        out.sort_by_key(|p| p.created_at);
        Ok(out)
    }
}
