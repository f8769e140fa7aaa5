//! Progress store atomicity, expiry and retention across both backends.

use quizgen::progress::{
    store_progress_callback, GenerationProgress, MemoryProgressStore, ProgressReport,
    ProgressStatus, ProgressStore, SledProgressStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sled_store(dir: &TempDir) -> Arc<SledProgressStore> {
    let db = sled::open(dir.path().join("progress")).unwrap();
    Arc::new(SledProgressStore::new(db).unwrap())
}

fn increment(current: &GenerationProgress) -> GenerationProgress {
    let mut next = current.clone();
    next.generated_count += 1;
    next
}

async fn hammer(store: Arc<dyn ProgressStore>, writers: usize, per_writer: usize) {
    let total = (writers * per_writer) as u32;
    store
        .set("shared", &GenerationProgress::pending("shared", "u1", total), None)
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..writers {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..per_writer {
                store.update("shared", &increment).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let record = store.get("shared").unwrap().unwrap();
    assert_eq!(record.generated_count, total);
    assert_eq!(record.user_id, "u1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_loses_no_concurrent_updates() {
    hammer(Arc::new(MemoryProgressStore::new()), 8, 50).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sled_store_loses_no_concurrent_updates() {
    let dir = TempDir::new().unwrap();
    hammer(sled_store(&dir), 8, 50).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_field_updates_are_all_kept() {
    let dir = TempDir::new().unwrap();
    let store = sled_store(&dir);
    store
        .set("t1", &GenerationProgress::pending("t1", "", 0), None)
        .unwrap();

    let owner = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                store
                    .update("t1", &|current: &GenerationProgress| {
                        let mut next = current.clone();
                        next.user_id = "owner".to_string();
                        next
                    })
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let counter = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                store
                    .update("t1", &|current: &GenerationProgress| {
                        let mut next = current.clone();
                        next.total_count += 1;
                        next
                    })
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    owner.await.unwrap();
    counter.await.unwrap();

    let record = store.get("t1").unwrap().unwrap();
    assert_eq!(record.user_id, "owner");
    assert_eq!(record.total_count, 100);
}

#[test]
fn sequential_reports_leave_the_last_count() {
    let store: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    store
        .set("t1", &GenerationProgress::pending("t1", "u1", 50), None)
        .unwrap();
    let callback = store_progress_callback(store.clone());

    for generated in [0u32, 10, 20, 30, 40, 50] {
        callback(ProgressReport {
            task_id: "t1".to_string(),
            generated,
            total: 50,
            status: ProgressStatus::Processing,
            error_message: None,
        });
    }
    let record = store.get("t1").unwrap().unwrap();
    assert_eq!(record.generated_count, 50);
    assert_eq!(record.status, ProgressStatus::Processing);
}

#[test]
fn terminal_records_ignore_late_reports() {
    let store: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let failed = GenerationProgress::pending("t1", "u1", 20)
        .fail("provider down")
        .unwrap();
    store.set("t1", &failed, None).unwrap();

    let callback = store_progress_callback(store.clone());
    callback(ProgressReport {
        task_id: "t1".to_string(),
        generated: 10,
        total: 20,
        status: ProgressStatus::Processing,
        error_message: None,
    });

    let record = store.get("t1").unwrap().unwrap();
    assert_eq!(record.status, ProgressStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("provider down"));
    assert_eq!(record.generated_count, 0);
}

#[test]
fn expiry_hides_and_purge_removes_records() {
    let dir = TempDir::new().unwrap();
    let store = sled_store(&dir);
    store
        .set("short", &GenerationProgress::pending("short", "u1", 5), Some(Duration::from_millis(10)))
        .unwrap();
    store
        .set("kept", &GenerationProgress::pending("kept", "u1", 5), None)
        .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert!(store.get("short").unwrap().is_none());
    assert_eq!(store.purge_expired().unwrap(), 1);
    assert_eq!(store.list().unwrap().len(), 1);
    assert_eq!(store.list_for_user("u1").unwrap().len(), 1);
    assert!(store.list_for_user("u2").unwrap().is_empty());
}

#[test]
fn update_keeps_an_existing_expiry() {
    let store = MemoryProgressStore::new();
    store
        .set("t1", &GenerationProgress::pending("t1", "u1", 5), None)
        .unwrap();
    assert!(store.expire("t1", Duration::from_millis(20)).unwrap());
    store.update("t1", &increment).unwrap();

    std::thread::sleep(Duration::from_millis(40));
    assert!(store.get("t1").unwrap().is_none());
    assert!(!store.expire("missing", Duration::from_secs(1)).unwrap());
}

#[test]
fn update_on_a_missing_key_starts_from_pending() {
    let store = MemoryProgressStore::new();
    let record = store.update("fresh", &increment).unwrap();
    assert_eq!(record.task_id, "fresh");
    assert_eq!(record.status, ProgressStatus::Pending);
    assert_eq!(record.generated_count, 1);
}

#[test]
fn prune_failed_removes_only_old_failures() {
    let store = MemoryProgressStore::new();
    let mut old = GenerationProgress::pending("old", "u1", 5).fail("boom").unwrap();
    let finished = old.completed_at.unwrap() - chrono::Duration::hours(2);
    old.completed_at = Some(finished);
    old.updated_at = finished;
    store.set("old", &old, None).unwrap();
    store
        .set("recent", &GenerationProgress::pending("recent", "u1", 5).fail("boom").unwrap(), None)
        .unwrap();
    store
        .set("pending", &GenerationProgress::pending("pending", "u1", 5), None)
        .unwrap();

    assert_eq!(store.prune_failed(Duration::from_secs(3600)).unwrap(), 1);
    assert!(store.get("old").unwrap().is_none());
    assert!(store.get("recent").unwrap().is_some());
    assert!(store.get("pending").unwrap().is_some());
}

#[test]
fn sled_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = sled_store(&dir);
        store
            .set("t1", &GenerationProgress::pending("t1", "u1", 12), None)
            .unwrap();
        store.flush().unwrap();
    }
    let store = sled_store(&dir);
    let record = store.get("t1").unwrap().unwrap();
    assert_eq!(record.total_count, 12);
    assert_eq!(record.status, ProgressStatus::Pending);
}
