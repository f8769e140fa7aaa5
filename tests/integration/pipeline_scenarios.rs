//! End-to-end pipeline: service, queue, scheduler, executor and progress together.

use crate::integration::test_utils::{
    request, wait_for_terminal, RecordingProgressStore, Reply, ScriptedProvider,
};
use async_trait::async_trait;
use quizgen::error::GenerationError;
use quizgen::executor::GenerationExecutor;
use quizgen::progress::{MemoryProgressStore, ProgressStatus, ProgressStore};
use quizgen::provider::{GenerationPrompt, QuestionProvider};
use quizgen::queue::{MemoryTaskQueue, TaskQueue};
use quizgen::repository::MemoryQuestionRepository;
use quizgen::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use quizgen::service::{GenerateOutcome, GenerationService, ServiceConfig};
use quizgen::types::GeneratedQuestion;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Pipeline {
    service: GenerationService,
    queue: Arc<MemoryTaskQueue>,
    progress: Arc<dyn ProgressStore>,
    repository: Arc<MemoryQuestionRepository>,
    scheduler: Arc<Scheduler>,
}

fn scheduler_config(completed_ttl: Option<Duration>) -> SchedulerConfig {
    SchedulerConfig {
        worker_concurrency: 2,
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(50),
        drain_log_interval: Duration::from_secs(1),
        completed_ttl,
    }
}

fn pipeline(
    provider: Arc<dyn QuestionProvider>,
    progress: Arc<dyn ProgressStore>,
    completed_ttl: Option<Duration>,
) -> Pipeline {
    let queue = Arc::new(MemoryTaskQueue::with_wait(Duration::from_millis(20)));
    let repository = Arc::new(MemoryQuestionRepository::new());
    let executor = Arc::new(GenerationExecutor::new(provider, repository.clone()).with_batch_size(10));
    let service = GenerationService::new(
        queue.clone(),
        progress.clone(),
        executor.clone(),
        ServiceConfig::default(),
    );
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        progress.clone(),
        executor,
        scheduler_config(completed_ttl),
    ));
    Pipeline {
        service,
        queue,
        progress,
        repository,
        scheduler,
    }
}

impl Pipeline {
    fn start(&self) -> SchedulerHandle {
        self.scheduler.spawn(CancellationToken::new())
    }

    async fn queue_task(&self, count: u32) -> String {
        match self.service.generate("user-1", &request(count)).await.unwrap() {
            GenerateOutcome::Queued(task_id) => task_id,
            other => panic!("expected a queued task, got {:?}", other),
        }
    }

    async fn wait_until_unqueued(&self, task_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.queue.contains(task_id).await.unwrap() {
            assert!(tokio::time::Instant::now() < deadline, "queue entry never removed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[tokio::test]
async fn small_request_is_answered_inline() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let p = pipeline(provider.clone(), Arc::new(MemoryProgressStore::new()), None);

    let questions = p.service.generate_sync("user-1", &request(5)).await.unwrap();

    assert_eq!(questions.len(), 5);
    assert_eq!(p.repository.len(), 5);
    assert!(p.queue.is_empty().await.unwrap());
    assert!(p.progress.list().unwrap().is_empty());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn large_request_runs_through_the_queue_to_completion() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_delay(Duration::from_millis(10)));
    let recorder = Arc::new(RecordingProgressStore::new());
    let p = pipeline(provider.clone(), recorder.clone(), Some(Duration::from_secs(3600)));

    let task_id = p.queue_task(50).await;
    let pending = p.service.get_progress("user-1", &task_id).unwrap().unwrap();
    assert_eq!(pending.status, ProgressStatus::Pending);

    let handle = p.start();
    let record = wait_for_terminal(p.progress.as_ref(), &task_id).await;
    p.wait_until_unqueued(&task_id).await;
    handle.shutdown().await.unwrap();

    assert_eq!(record.status, ProgressStatus::Completed);
    assert_eq!(record.generated_count, 50);
    assert!(record.completed_at.is_some());
    assert_eq!(p.repository.len(), 50);
    assert_eq!(provider.calls(), 5);

    let history = recorder.history(&task_id);
    assert_eq!(history.first(), Some(&(ProgressStatus::Pending, 0)));
    assert_eq!(history.last(), Some(&(ProgressStatus::Completed, 50)));
    let processing: Vec<u32> = history
        .iter()
        .filter(|(status, _)| *status == ProgressStatus::Processing)
        .map(|(_, generated)| *generated)
        .collect();
    assert_eq!(processing, vec![0, 10, 20, 30, 40, 50]);
}

#[tokio::test]
async fn failure_after_some_batches_is_partial_success() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Reply::Questions(10),
        Reply::Questions(10),
        Reply::Fail("upstream rejected the prompt".to_string()),
    ]));
    let p = pipeline(provider.clone(), Arc::new(MemoryProgressStore::new()), None);

    let task_id = p.queue_task(50).await;
    let handle = p.start();
    let record = wait_for_terminal(p.progress.as_ref(), &task_id).await;
    p.wait_until_unqueued(&task_id).await;
    handle.shutdown().await.unwrap();

    assert_eq!(record.status, ProgressStatus::PartialSuccess);
    assert_eq!(record.generated_count, 20);
    assert_eq!(record.total_count, 50);
    assert_eq!(p.repository.len(), 20);
    assert_eq!(provider.calls(), 3);
    assert!(p.progress.get(&task_id).unwrap().is_some());
}

#[tokio::test]
async fn failure_on_the_first_batch_fails_the_task() {
    let provider = Arc::new(ScriptedProvider::new(vec![Reply::Exhausted(503)]));
    let p = pipeline(provider.clone(), Arc::new(MemoryProgressStore::new()), None);

    let task_id = p.queue_task(50).await;
    let handle = p.start();
    let record = wait_for_terminal(p.progress.as_ref(), &task_id).await;
    p.wait_until_unqueued(&task_id).await;
    handle.shutdown().await.unwrap();

    assert_eq!(record.status, ProgressStatus::Failed);
    assert_eq!(record.generated_count, 0);
    assert!(record.error_message.as_deref().unwrap().contains("503"));
    assert!(p.repository.is_empty());
    assert_eq!(provider.calls(), 1);
    assert!(p.progress.get(&task_id).unwrap().is_some());
}

#[tokio::test]
async fn completed_records_expire_and_failed_records_are_retained() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Reply::Questions(10),
        Reply::Fail("bad request".to_string()),
    ]));
    let p = pipeline(provider, Arc::new(MemoryProgressStore::new()), Some(Duration::from_millis(50)));

    let completed = p.queue_task(10).await;
    let handle = p.start();
    wait_for_terminal(p.progress.as_ref(), &completed).await;
    p.wait_until_unqueued(&completed).await;

    let failed = p.queue_task(10).await;
    wait_for_terminal(p.progress.as_ref(), &failed).await;
    p.wait_until_unqueued(&failed).await;
    handle.shutdown().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(p.service.get_progress("user-1", &completed).unwrap().is_none());
    let kept = p.service.get_progress("user-1", &failed).unwrap().unwrap();
    assert_eq!(kept.status, ProgressStatus::Failed);
}

struct PanickingProvider;

#[async_trait]
impl QuestionProvider for PanickingProvider {
    async fn generate(
        &self,
        _prompt: &GenerationPrompt,
        _cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedQuestion>, GenerationError> {
        panic!("model client exploded");
    }

    fn provider_name(&self) -> &str {
        "panicking"
    }

    fn model_name(&self) -> &str {
        "none"
    }
}

#[tokio::test]
async fn panicking_execution_is_recorded_failed_and_frees_its_slot() {
    let p = pipeline(Arc::new(PanickingProvider), Arc::new(MemoryProgressStore::new()), None);

    let first = p.queue_task(10).await;
    let second = p.queue_task(10).await;
    let third = p.queue_task(10).await;
    let handle = p.start();

    for task_id in [&first, &second, &third] {
        let record = wait_for_terminal(p.progress.as_ref(), task_id).await;
        assert_eq!(record.status, ProgressStatus::Failed);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("model client exploded"));
        p.wait_until_unqueued(task_id).await;
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while p.scheduler.in_flight() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "slots never released");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.shutdown().await.unwrap();
    assert_eq!(p.scheduler.in_flight(), 0);
}
