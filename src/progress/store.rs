//! Durable sled-backed progress store.

use std::sync::Arc;
use std::time::Duration;

use sled::{Db, Tree};

use crate::error::{json_to_storage, sled_to_storage, StorageError};
use crate::progress::{
    expiry_from_now, now_millis, GenerationProgress, ProgressMutator, ProgressStore,
    StoredProgress,
};

const TREE_PROGRESS: &str = "generation_progress";

/// Records live in one sled tree keyed by task id. `update` runs through sled's
/// compare-and-swap loop, so a concurrent writer is never overwritten with a value
/// computed from stale data.
#[derive(Clone)]
pub struct SledProgressStore {
    db: Db,
    records: Tree,
}

impl SledProgressStore {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let records = db.open_tree(TREE_PROGRESS).map_err(sled_to_storage)?;
        Ok(Self { db, records })
    }

    pub fn shared(db: Db) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn decode(key: &str, raw: &[u8]) -> Result<StoredProgress, StorageError> {
        serde_json::from_slice(raw).map_err(|e| StorageError::CorruptRecord {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn encode(stored: &StoredProgress) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(stored).map_err(json_to_storage)
    }
}

impl ProgressStore for SledProgressStore {
    fn get(&self, task_id: &str) -> Result<Option<GenerationProgress>, StorageError> {
        let Some(raw) = self
            .records
            .get(task_id.as_bytes())
            .map_err(sled_to_storage)?
        else {
            return Ok(None);
        };
        let stored = Self::decode(task_id, &raw)?;
        if stored.is_expired(now_millis()) {
            return Ok(None);
        }
        Ok(Some(stored.record))
    }

    fn set(
        &self,
        task_id: &str,
        progress: &GenerationProgress,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let value = Self::encode(&StoredProgress::new(progress.clone(), ttl))?;
        self.records
            .insert(task_id.as_bytes(), value)
            .map_err(sled_to_storage)?;
        Ok(())
    }

    fn update(
        &self,
        task_id: &str,
        mutator: ProgressMutator<'_>,
    ) -> Result<GenerationProgress, StorageError> {
        let mut failure: Option<StorageError> = None;
        let written = self
            .records
            .update_and_fetch(task_id.as_bytes(), |old| {
                failure = None;
                let now = now_millis();
                let (current, expires_at_ms) = match old {
                    Some(raw) => match Self::decode(task_id, raw) {
                        Ok(stored) if !stored.is_expired(now) => {
                            (stored.record, stored.expires_at_ms)
                        }
                        Ok(_) => (GenerationProgress::pending(task_id, "", 0), None),
                        Err(err) => {
                            failure = Some(err);
                            return Some(raw.to_vec());
                        }
                    },
                    None => (GenerationProgress::pending(task_id, "", 0), None),
                };
                let next = StoredProgress {
                    record: mutator(&current),
                    expires_at_ms,
                };
                match Self::encode(&next) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        failure = Some(err);
                        old.map(<[u8]>::to_vec)
                    }
                }
            })
            .map_err(sled_to_storage)?;

        if let Some(err) = failure {
            return Err(err);
        }
        let raw = written.ok_or_else(|| StorageError::CorruptRecord {
            key: task_id.to_string(),
            message: "record vanished during update".to_string(),
        })?;
        Ok(Self::decode(task_id, &raw)?.record)
    }

    fn remove(&self, task_id: &str) -> Result<(), StorageError> {
        self.records
            .remove(task_id.as_bytes())
            .map_err(sled_to_storage)?;
        Ok(())
    }

    fn expire(&self, task_id: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut failure: Option<StorageError> = None;
        let mut found = false;
        self.records
            .update_and_fetch(task_id.as_bytes(), |old| {
                failure = None;
                found = false;
                let raw = old?;
                let mut stored = match Self::decode(task_id, raw) {
                    Ok(stored) => stored,
                    Err(err) => {
                        failure = Some(err);
                        return Some(raw.to_vec());
                    }
                };
                if stored.is_expired(now_millis()) {
                    return Some(raw.to_vec());
                }
                stored.expires_at_ms = Some(expiry_from_now(ttl));
                match Self::encode(&stored) {
                    Ok(bytes) => {
                        found = true;
                        Some(bytes)
                    }
                    Err(err) => {
                        failure = Some(err);
                        Some(raw.to_vec())
                    }
                }
            })
            .map_err(sled_to_storage)?;

        match failure {
            Some(err) => Err(err),
            None => Ok(found),
        }
    }

    fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = now_millis();
        let mut removed = 0usize;
        for result in self.records.iter() {
            let (key, value) = result.map_err(sled_to_storage)?;
            let key_text = String::from_utf8_lossy(&key).to_string();
            let stored = Self::decode(&key_text, &value)?;
            if stored.is_expired(now) {
                // Only delete the exact value inspected; a concurrent rewrite survives.
                let swapped = self
                    .records
                    .compare_and_swap(&key, Some(&value), None as Option<&[u8]>)
                    .map_err(sled_to_storage)?;
                if swapped.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<GenerationProgress>, StorageError> {
        let now = now_millis();
        let mut out = Vec::new();
        for result in self.records.iter() {
            let (key, value) = result.map_err(sled_to_storage)?;
            let stored = Self::decode(&String::from_utf8_lossy(&key), &value)?;
            if !stored.is_expired(now) {
                out.push(stored.record);
            }
        }
        out.sort_by_key(|p| p.created_at);
        Ok(out)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(sled_to_storage)?;
        Ok(())
    }
}
