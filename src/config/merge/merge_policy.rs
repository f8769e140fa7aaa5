//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

use crate::config::{PipelineConfig, RetryConfig, StorageConfig};

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    let pipeline = PipelineConfig::default();
    let retry = RetryConfig::default();
    let storage = StorageConfig::default();
    Config::builder()
        .set_default("pipeline.worker_concurrency", pipeline.worker_concurrency as i64)?
        .set_default("pipeline.poll_interval_ms", pipeline.poll_interval_ms as i64)?
        .set_default("pipeline.dequeue_wait_ms", pipeline.dequeue_wait_ms as i64)?
        .set_default("pipeline.error_backoff_ms", pipeline.error_backoff_ms as i64)?
        .set_default("pipeline.drain_log_interval_secs", pipeline.drain_log_interval_secs as i64)?
        .set_default("pipeline.sync_threshold", pipeline.sync_threshold as i64)?
        .set_default("pipeline.batch_size", pipeline.batch_size as i64)?
        .set_default("pipeline.max_count", pipeline.max_count as i64)?
        .set_default("pipeline.completed_ttl_secs", pipeline.completed_ttl_secs as i64)?
        .set_default("retry.max_retries", retry.max_retries as i64)?
        .set_default("retry.base_delay_ms", retry.base_delay_ms as i64)?
        .set_default("storage.path", storage.path.to_string_lossy().to_string())
}
