//! Question persistence.
//!
//! The pipeline only needs to know a batch was written; everything else about question
//! storage belongs to the surrounding application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};

use crate::error::{json_to_storage, sled_to_storage, GenerationError, StorageError};
use crate::types::GeneratedQuestion;

const TREE_QUESTIONS: &str = "questions";

/// A persisted question with its ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredQuestion {
    pub question_id: String,
    pub user_id: String,
    pub question_bank_id: Option<String>,
    pub question: GeneratedQuestion,
    pub created_at: DateTime<Utc>,
}

impl StoredQuestion {
    fn new(user_id: &str, question_bank_id: Option<&str>, question: GeneratedQuestion) -> Self {
        Self {
            question_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            question_bank_id: question_bank_id.map(str::to_string),
            question,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait QuestionRepository: Send + Sync {
    /// Write one batch, all or nothing.
    async fn persist(
        &self,
        user_id: &str,
        question_bank_id: Option<&str>,
        questions: &[GeneratedQuestion],
    ) -> Result<(), GenerationError>;
}

/// Questions in a sled tree keyed `{user_id}/{question_id}`.
pub struct SledQuestionRepository {
    questions: Tree,
}

impl SledQuestionRepository {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        let questions = db.open_tree(TREE_QUESTIONS).map_err(sled_to_storage)?;
        Ok(Self { questions })
    }

    fn key(user_id: &str, question_id: &str) -> String {
        format!("{}/{}", user_id, question_id)
    }

    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<StoredQuestion>, StorageError> {
        let prefix = format!("{}/", user_id);
        let mut out = Vec::new();
        for result in self.questions.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(sled_to_storage)?;
            out.push(serde_json::from_slice(&value).map_err(json_to_storage)?);
        }
        out.sort_by_key(|q: &StoredQuestion| q.created_at);
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[async_trait]
impl QuestionRepository for SledQuestionRepository {
    async fn persist(
        &self,
        user_id: &str,
        question_bank_id: Option<&str>,
        questions: &[GeneratedQuestion],
    ) -> Result<(), GenerationError> {
        let mut batch = Batch::default();
        for question in questions {
            let stored = StoredQuestion::new(user_id, question_bank_id, question.clone());
            let value = serde_json::to_vec(&stored)
                .map_err(|e| GenerationError::Persistence(e.to_string()))?;
            batch.insert(Self::key(user_id, &stored.question_id).as_bytes(), value);
        }
        self.questions
            .apply_batch(batch)
            .map_err(|e| GenerationError::Persistence(e.to_string()))
    }
}

/// In-process repository for embedding and tests.
#[derive(Default)]
pub struct MemoryQuestionRepository {
    questions: Mutex<Vec<StoredQuestion>>,
}

impl MemoryQuestionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<StoredQuestion> {
        self.questions.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.questions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.lock().is_empty()
    }
}

#[async_trait]
impl QuestionRepository for MemoryQuestionRepository {
    async fn persist(
        &self,
        user_id: &str,
        question_bank_id: Option<&str>,
        questions: &[GeneratedQuestion],
    ) -> Result<(), GenerationError> {
        let mut stored = self.questions.lock();
        stored.extend(
            questions
                .iter()
                .cloned()
                .map(|q| StoredQuestion::new(user_id, question_bank_id, q)),
        );
        Ok(())
    }
}
