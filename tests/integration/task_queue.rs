//! Task queue behavior shared by the in-memory and sled backends.

use crate::integration::test_utils::request;
use quizgen::queue::{MemoryTaskQueue, QueuedTask, SledTaskQueue, TaskQueue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn task(id: &str, count: u32) -> QueuedTask {
    QueuedTask::new(id.to_string(), "user-1".to_string(), request(count))
}

fn sled_queue(dir: &TempDir, wait: Duration) -> SledTaskQueue {
    let db = sled::open(dir.path().join("queue")).unwrap();
    SledTaskQueue::with_wait(db, wait).unwrap()
}

async fn check_fifo_round_trip(queue: &dyn TaskQueue) {
    let first = task("a", 10);
    let second = task("b", 20);
    queue.enqueue(first.clone()).await.unwrap();
    queue.enqueue(second.clone()).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 2);

    let cancel = CancellationToken::new();
    assert_eq!(queue.dequeue(&cancel).await.unwrap(), Some(first));
    assert_eq!(queue.dequeue(&cancel).await.unwrap(), Some(second));
    assert!(queue.is_empty().await.unwrap());
}

async fn check_empty_dequeue_is_bounded(queue: &dyn TaskQueue) {
    let started = Instant::now();
    assert!(queue
        .dequeue(&CancellationToken::new())
        .await
        .unwrap()
        .is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
}

async fn check_claim_lifecycle(queue: &dyn TaskQueue) {
    queue.enqueue(task("claimed", 5)).await.unwrap();
    let claimed = queue
        .dequeue(&CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
    assert!(queue.contains(&claimed.task_id).await.unwrap());

    queue.complete_task(&claimed.task_id).await.unwrap();
    assert!(!queue.contains(&claimed.task_id).await.unwrap());
    // Idempotent
    queue.complete_task(&claimed.task_id).await.unwrap();
    queue.complete_task("never-existed").await.unwrap();
}

#[tokio::test]
async fn memory_queue_contract() {
    let queue = MemoryTaskQueue::with_wait(Duration::from_millis(20));
    check_fifo_round_trip(&queue).await;
    check_empty_dequeue_is_bounded(&queue).await;
    check_claim_lifecycle(&queue).await;
}

#[tokio::test]
async fn sled_queue_contract() {
    let dir = TempDir::new().unwrap();
    let queue = sled_queue(&dir, Duration::from_millis(20));
    check_fifo_round_trip(&queue).await;
    check_empty_dequeue_is_bounded(&queue).await;
    check_claim_lifecycle(&queue).await;
}

#[tokio::test]
async fn duplicates_are_not_rejected() {
    let queue = MemoryTaskQueue::with_wait(Duration::ZERO);
    queue.enqueue(task("dup", 5)).await.unwrap();
    queue.enqueue(task("dup", 5)).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 2);
}

#[tokio::test]
async fn cancelled_dequeue_returns_none_without_taking_work() {
    let queue = Arc::new(MemoryTaskQueue::with_wait(Duration::from_secs(30)));
    let cancel = CancellationToken::new();
    let waiter = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.dequeue(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let started = Instant::now();
    cancel.cancel();
    let result = waiter.await.unwrap().unwrap();
    assert!(result.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    queue.enqueue(task("after-cancel", 5)).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn waiting_dequeue_wakes_on_enqueue() {
    let queue = Arc::new(MemoryTaskQueue::with_wait(Duration::from_secs(5)));
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue(&CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let started = Instant::now();
    queue.enqueue(task("late", 5)).await.unwrap();
    let got = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(got.task_id, "late");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn sled_queue_survives_reopen_and_reports_stale_claims() {
    let dir = TempDir::new().unwrap();
    {
        let queue = sled_queue(&dir, Duration::ZERO);
        queue.enqueue(task("pending", 10)).await.unwrap();
        queue.enqueue(task("in-flight", 20)).await.unwrap();
        queue.enqueue(task("left-over", 30)).await.unwrap();
        let claimed = queue
            .dequeue(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task_id, "pending");
        queue.db().flush().unwrap();
    }

    let queue = sled_queue(&dir, Duration::ZERO);
    assert_eq!(queue.len().await.unwrap(), 2);

    let stale = queue.drain_claimed().await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].task_id, "pending");
    assert!(queue.drain_claimed().await.unwrap().is_empty());

    let next = queue
        .dequeue(&CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.task_id, "in-flight");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_never_share_a_task() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(sled_queue(&dir, Duration::from_millis(10)));
    for i in 0..40 {
        queue.enqueue(task(&format!("t{}", i), 5)).await.unwrap();
    }

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        consumers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            let cancel = CancellationToken::new();
            while let Some(task) = queue.dequeue(&cancel).await.unwrap() {
                seen.push(task.task_id);
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 40);
}
