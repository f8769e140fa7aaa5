//! Configuration System
//!
//! Layered configuration for the pipeline: built-in defaults, the user's global file,
//! workspace files, then `QUIZGEN__SECTION__KEY` environment overrides.

use crate::logging::LoggingConfig;
use crate::scheduler::SchedulerConfig;
use crate::service::ServiceConfig;
use crate::transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::provider::{ProviderConfig, ProviderType};

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuizgenConfig {
    /// Model provider configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Provider used when a request does not name one
    #[serde(default)]
    pub default_provider: Option<String>,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Queue, worker pool and service tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Longest a single dequeue waits for work
    #[serde(default = "default_dequeue_wait_ms")]
    pub dequeue_wait_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    #[serde(default = "default_drain_log_interval_secs")]
    pub drain_log_interval_secs: u64,

    /// Requests below this count are generated inline
    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: u32,

    /// Questions per provider call
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_max_count")]
    pub max_count: u32,

    /// Expiry for completed and partially successful records; 0 keeps them forever
    #[serde(default = "default_completed_ttl_secs")]
    pub completed_ttl_secs: u64,
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_dequeue_wait_ms() -> u64 {
    250
}

fn default_error_backoff_ms() -> u64 {
    2000
}

fn default_drain_log_interval_secs() -> u64 {
    5
}

fn default_sync_threshold() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    10
}

fn default_max_count() -> u32 {
    500
}

fn default_completed_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            dequeue_wait_ms: default_dequeue_wait_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            drain_log_interval_secs: default_drain_log_interval_secs(),
            sync_threshold: default_sync_threshold(),
            batch_size: default_batch_size(),
            max_count: default_max_count(),
            completed_ttl_secs: default_completed_ttl_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_concurrency: self.worker_concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            drain_log_interval: Duration::from_secs(self.drain_log_interval_secs),
            completed_ttl: (self.completed_ttl_secs > 0)
                .then(|| Duration::from_secs(self.completed_ttl_secs)),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            sync_threshold: self.sync_threshold,
            max_count: self.max_count,
        }
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_millis(self.dequeue_wait_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.worker_concurrency == 0 {
            return Err("worker_concurrency must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.max_count == 0 {
            return Err("max_count must be at least 1".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be positive".to_string());
        }
        if self.drain_log_interval_secs == 0 {
            return Err("drain_log_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Provider call retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > 10 {
            return Err(format!(
                "max_retries of {} would back off for hours; use 10 or fewer",
                self.max_retries
            ));
        }
        Ok(())
    }
}

/// On-disk state location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory holding the queue, progress records and questions
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    data_dir().join("store")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StorageConfig {
    /// Relative paths are taken from the workspace root.
    pub fn resolve(&self, workspace_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            workspace_root.join(&self.path)
        }
    }
}

/// Platform data directory for quizgen, `.quizgen` when none can be determined.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "quizgen")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".quizgen"))
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Provider(String, String),
    Pipeline(String),
    Retry(String),
    Storage(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(name, msg) => {
                write!(f, "Provider '{}': {}", name, msg)
            }
            ValidationError::Pipeline(msg) => write!(f, "Pipeline: {}", msg),
            ValidationError::Retry(msg) => write!(f, "Retry: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl QuizgenConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (name, provider) in &self.providers {
            if let Err(e) = provider.validate() {
                errors.push(ValidationError::Provider(name.clone(), e));
            }
        }
        if let Some(default) = &self.default_provider {
            if !self.providers.contains_key(default) {
                errors.push(ValidationError::Provider(
                    default.clone(),
                    "default_provider is not defined under [providers]".to_string(),
                ));
            }
        }
        if let Err(e) = self.pipeline.validate() {
            errors.push(ValidationError::Pipeline(e));
        }
        if let Err(e) = self.retry.validate() {
            errors.push(ValidationError::Retry(e));
        }
        if self.storage.path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "Store path cannot be empty".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
