//! The scheduler keeps polling through queue outages, and shutdown reaches retry
//! backoffs inside running tasks.

use crate::integration::test_utils::{request, wait_for_terminal, ScriptedProvider, StubServer};
use async_trait::async_trait;
use quizgen::error::{QueueError, StorageError};
use quizgen::executor::{GenerationExecutor, CANCELLED_MESSAGE};
use quizgen::progress::{MemoryProgressStore, ProgressStatus, ProgressStore};
use quizgen::provider::{ChatCompletionsProvider, ProviderConfig, ProviderType};
use quizgen::queue::{MemoryTaskQueue, QueuedTask, TaskQueue};
use quizgen::repository::MemoryQuestionRepository;
use quizgen::scheduler::{Scheduler, SchedulerConfig, SchedulerState};
use quizgen::service::{GenerationService, ServiceConfig};
use quizgen::transport::RetryPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Memory queue whose first `failures` dequeues report a storage error.
struct FlakyQueue {
    inner: MemoryTaskQueue,
    failures: AtomicUsize,
    failed: AtomicUsize,
}

impl FlakyQueue {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryTaskQueue::with_wait(Duration::from_millis(10)),
            failures: AtomicUsize::new(failures),
            failed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskQueue for FlakyQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError> {
        self.inner.enqueue(task).await
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<QueuedTask>, QueueError> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(QueueError::Storage(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unavailable",
            ))));
        }
        self.inner.dequeue(cancel).await
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), QueueError> {
        self.inner.complete_task(task_id).await
    }

    async fn len(&self) -> Result<usize, QueueError> {
        self.inner.len().await
    }

    async fn contains(&self, task_id: &str) -> Result<bool, QueueError> {
        self.inner.contains(task_id).await
    }

    async fn drain_claimed(&self) -> Result<Vec<QueuedTask>, QueueError> {
        self.inner.drain_claimed().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_errors_back_off_and_polling_resumes() {
    let error_backoff = Duration::from_millis(20);
    let queue = Arc::new(FlakyQueue::new(3));
    let progress = Arc::new(MemoryProgressStore::new());
    let executor = Arc::new(GenerationExecutor::new(
        Arc::new(ScriptedProvider::new(Vec::new())),
        Arc::new(MemoryQuestionRepository::new()),
    ));
    let service = GenerationService::new(
        queue.clone(),
        progress.clone(),
        executor.clone(),
        ServiceConfig::default(),
    );
    let task_id = service.start_async("user-1", &request(20)).await.unwrap();

    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        progress.clone(),
        executor,
        SchedulerConfig {
            worker_concurrency: 2,
            poll_interval: Duration::from_millis(10),
            error_backoff,
            drain_log_interval: Duration::from_millis(50),
            completed_ttl: None,
        },
    ));

    let started = tokio::time::Instant::now();
    let handle = scheduler.spawn(CancellationToken::new());
    let record = wait_for_terminal(progress.as_ref(), &task_id).await;

    assert!(started.elapsed() >= error_backoff * 3);
    assert_eq!(queue.failed.load(Ordering::SeqCst), 3);
    assert_eq!(record.status, ProgressStatus::Completed);
    assert_eq!(record.generated_count, 20);
    assert_eq!(handle.state(), SchedulerState::Running);

    handle.shutdown().await.unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

fn unavailable_provider(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        provider_name: Some("stub".to_string()),
        provider_type: ProviderType::Local,
        model: "stub-model".to_string(),
        api_key: None,
        endpoint: Some(base_url.to_string()),
        temperature: None,
        max_tokens: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_retry_backoff_of_running_task() {
    let server = StubServer::start(vec![(503, r#"{"error":"busy"}"#.to_string())]).await;
    let provider = ChatCompletionsProvider::new(
        "stub",
        &unavailable_provider(&server.base_url),
        RetryPolicy::new(5, Duration::from_secs(30)),
    )
    .unwrap();

    let queue = Arc::new(MemoryTaskQueue::with_wait(Duration::from_millis(20)));
    let progress = Arc::new(MemoryProgressStore::new());
    let executor = Arc::new(GenerationExecutor::new(
        Arc::new(provider),
        Arc::new(MemoryQuestionRepository::new()),
    ));
    let service = GenerationService::new(
        queue.clone(),
        progress.clone(),
        executor.clone(),
        ServiceConfig::default(),
    );
    let task_id = service.start_async("user-1", &request(20)).await.unwrap();

    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        progress.clone(),
        executor,
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        },
    ));
    let handle = scheduler.spawn(CancellationToken::new());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.hits() == 0 || scheduler.in_flight() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "task never reached the provider");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Let the first 503 land so the task is sleeping in its backoff.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_eq!(server.hits(), 1);

    let record = progress.get(&task_id).unwrap().unwrap();
    assert_eq!(record.status, ProgressStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(!queue.contains(&task_id).await.unwrap());
}
