//! CLI route: single route table and run context. Dispatches to pipeline services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::parse::Commands;
use crate::config::{ConfigLoader, QuizgenConfig};
use crate::error::{json_to_storage, sled_to_storage, GenerationError, StorageError};
use crate::executor::GenerationExecutor;
use crate::init::initialize_workspace;
use crate::progress::{GenerationProgress, ProgressStore, SledProgressStore};
use crate::provider::ProviderRegistry;
use crate::queue::{SledTaskQueue, TaskQueue};
use crate::repository::SledQuestionRepository;
use crate::scheduler::Scheduler;
use crate::service::{progress_for_user, GenerateOutcome, GenerationService};
use crate::types::{GenerationRequest, QuestionType};

/// Runtime context for CLI execution: loaded config and the sled-backed stores.
/// Built from workspace path and optional config path using ConfigLoader only.
pub struct RunContext {
    config: QuizgenConfig,
    store_path: PathBuf,
    providers: ProviderRegistry,
    queue: Arc<SledTaskQueue>,
    progress: Arc<SledProgressStore>,
    repository: Arc<SledQuestionRepository>,
}

impl RunContext {
    /// Create run context from workspace root and optional config path.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, GenerationError> {
        let config = match config_path {
            Some(ref cfg_path) => ConfigLoader::load_from_file(cfg_path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        config.validate().map_err(|errors| {
            let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            GenerationError::ConfigError(details.join("; "))
        })?;

        let store_path = config.storage.resolve(&workspace_root);
        std::fs::create_dir_all(&store_path).map_err(StorageError::IoError)?;
        let db = sled::open(&store_path).map_err(sled_to_storage)?;

        let queue = Arc::new(SledTaskQueue::with_wait(
            db.clone(),
            config.pipeline.dequeue_wait(),
        )?);
        let progress = Arc::new(SledProgressStore::new(db.clone())?);
        let repository = Arc::new(SledQuestionRepository::new(&db)?);
        let providers = ProviderRegistry::from_config(&config);

        Ok(Self {
            config,
            store_path,
            providers,
            queue,
            progress,
            repository,
        })
    }

    pub fn config(&self) -> &QuizgenConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<String, GenerationError> {
        let result = match command {
            Commands::Worker { provider } => self.run_worker(provider.as_deref()).await,
            Commands::Generate {
                user,
                topic,
                count,
                difficulty,
                question_types,
                data_source,
                bank,
                provider,
                wait,
            } => {
                let request = GenerationRequest {
                    topic: topic.clone(),
                    count: *count,
                    difficulty: *difficulty,
                    question_types: if question_types.is_empty() {
                        vec![QuestionType::MultipleChoice]
                    } else {
                        question_types.clone()
                    },
                    data_source_id: data_source.clone(),
                    question_bank_id: bank.clone(),
                };
                self.handle_generate(user, &request, provider.as_deref(), *wait)
                    .await
            }
            Commands::Progress { user, task_id } => {
                match progress_for_user(self.progress.as_ref(), user, task_id)? {
                    Some(record) => to_json(&record),
                    None => Ok(format!("Task {} not found", task_id)),
                }
            }
            Commands::Purge { failed_older_than } => self.handle_purge(*failed_older_than),
            Commands::Queue => {
                let pending = self.queue.len().await?;
                Ok(format!("Pending tasks: {}", pending))
            }
            Commands::Init { .. } => Err(GenerationError::InvalidRequest(
                "init runs before the workspace is opened".to_string(),
            )),
        };
        self.progress.flush()?;
        result
    }

    fn executor(&self, provider: Option<&str>) -> Result<Arc<GenerationExecutor>, GenerationError> {
        let provider = self.providers.create_provider(provider)?;
        Ok(Arc::new(
            GenerationExecutor::new(provider, self.repository.clone())
                .with_batch_size(self.config.pipeline.batch_size),
        ))
    }

    fn scheduler(&self, executor: Arc<GenerationExecutor>) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            self.queue.clone(),
            self.progress.clone(),
            executor,
            self.config.pipeline.scheduler_config(),
        ))
    }

    async fn run_worker(&self, provider: Option<&str>) -> Result<String, GenerationError> {
        let scheduler = self.scheduler(self.executor(provider)?);
        let recovered = scheduler.recover_interrupted().await?;

        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());
        info!(store = %self.store_path.display(), "Worker running, press Ctrl-C to stop");

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
        }
        info!(in_flight = scheduler.in_flight(), "Shutdown requested, draining");
        handle.shutdown().await?;

        Ok(format!(
            "Worker stopped ({} interrupted task(s) recovered at startup)",
            recovered
        ))
    }

    async fn handle_generate(
        &self,
        user_id: &str,
        request: &GenerationRequest,
        provider: Option<&str>,
        wait: bool,
    ) -> Result<String, GenerationError> {
        let executor = self.executor(provider)?;
        let shutdown = CancellationToken::new();
        let service = GenerationService::new(
            self.queue.clone(),
            self.progress.clone(),
            executor.clone(),
            self.config.pipeline.service_config(),
        )
        .with_cancellation(shutdown.clone());

        match service.generate(user_id, request).await? {
            GenerateOutcome::Completed(questions) => to_json(&questions),
            GenerateOutcome::Queued(task_id) if !wait => Ok(task_id),
            GenerateOutcome::Queued(task_id) => {
                println!("{}", task_id);
                let handle = self.scheduler(executor).spawn(shutdown.clone());
                let watched = self.follow_progress(&service, user_id, &task_id).await;
                handle.shutdown().await?;
                match watched? {
                    Some(record) => to_json(&record),
                    None => Ok(format!("Task {} interrupted", task_id)),
                }
            }
        }
    }

    /// Print each progress change until the task is terminal. `None` on Ctrl-C.
    async fn follow_progress(
        &self,
        service: &GenerationService,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<GenerationProgress>, GenerationError> {
        let mut ticker = tokio::time::interval(self.config.pipeline.scheduler_config().poll_interval);
        let mut last_seen: Option<(String, u32)> = None;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(None),
                _ = ticker.tick() => {}
            }
            let Some(record) = service.get_progress(user_id, task_id)? else {
                continue;
            };
            let current = (record.status.to_string(), record.generated_count);
            if last_seen.as_ref() != Some(&current) {
                println!(
                    "{} {}/{}",
                    record.status, record.generated_count, record.total_count
                );
                last_seen = Some(current);
            }
            if record.is_terminal() {
                return Ok(Some(record));
            }
        }
    }

    fn handle_purge(&self, failed_older_than: Option<u64>) -> Result<String, GenerationError> {
        let expired = self.progress.purge_expired()?;
        let failed = match failed_older_than {
            Some(secs) => self.progress.prune_failed(Duration::from_secs(secs))?,
            None => 0,
        };
        info!(expired, failed, "Purged progress records");
        Ok(format!(
            "Purged {} expired and {} failed progress record(s)",
            expired, failed
        ))
    }
}

/// `init` runs without a RunContext: it must work before any config exists.
pub fn run_init(workspace_root: &Path, force: bool) -> Result<String, GenerationError> {
    let result = initialize_workspace(workspace_root, force)?;
    Ok(if result.written {
        format!("Wrote {}", result.config_path.display())
    } else {
        format!(
            "{} already exists (use --force to overwrite)",
            result.config_path.display()
        )
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String, GenerationError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| GenerationError::Storage(json_to_storage(e)))
}
