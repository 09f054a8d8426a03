//! The job queue driving the real sync engine over in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use kbsync_core::settings::Settings;
use kbsync_core::store::{self, ConfigStore, FsStore};
use kbsync_core::types::{Business, BusinessId, ConfigId, SyncStatus};
use kbsync_daemon::jobs::run_worker;
use kbsync_daemon::{JobPolicy, JobQueue, JobRunner, JobSource, QueueSnapshot};
use kbsync_sync::fakes::{FakeAssistantApi, MemoryObjectStore};
use kbsync_sync::SyncEngine;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;

fn cfg() -> ConfigId {
    ConfigId::from("cfg-acme")
}

fn engine(home: &TempDir, api: Arc<FakeAssistantApi>) -> Arc<SyncEngine> {
    store::put_payload_at(
        home.path(),
        &cfg(),
        Business {
            id: BusinessId::from("acme"),
            name: "Acme Spa".to_string(),
            assistant_id: Some("asst-1".to_string()),
        },
        None,
        json!({"establishment": {"address": "1 Main St"}}),
    )
    .expect("put payload");
    let fs = Arc::new(FsStore::new(home.path()));
    let settings = Settings {
        patch_max_retries: 1,
        patch_backoff_base_ms: 1,
        ..Settings::default()
    };
    Arc::new(
        SyncEngine::new(
            fs.clone(),
            fs,
            api,
            Arc::new(MemoryObjectStore::default()),
            settings,
        )
        .expect("engine")
        .with_scratch_parent(home.path()),
    )
}

fn classic_assistant() -> Value {
    json!({"model": {"provider": "openai"}, "knowledgeBase": {"provider": "google"}})
}

async fn drive(
    queue: &Arc<JobQueue>,
    runner: Arc<dyn JobRunner>,
    done: impl Fn(&QueueSnapshot) -> bool,
) -> QueueSnapshot {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker = tokio::spawn(run_worker(queue.clone(), runner, shutdown_rx));
    queue.enqueue(cfg(), JobSource::Socket);
    for _ in 0..2_000 {
        let snapshot = queue.snapshot();
        if done(&snapshot) {
            let _ = shutdown_tx.send(());
            let _ = worker.await;
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("queue never settled: {:?}", queue.snapshot());
}

fn policy() -> JobPolicy {
    JobPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_secs(2),
    }
}

#[tokio::test(start_paused = true)]
async fn error_status_is_retried_then_dead_lettered() {
    let home = TempDir::new().expect("home");
    let api = Arc::new(FakeAssistantApi::default().with_assistant("asst-1", classic_assistant()));
    api.script_patch_errors((0..3).map(|_| (500, "upstream unavailable".to_string())));
    let engine = engine(&home, api.clone());
    let queue = Arc::new(JobQueue::persistent_at(home.path(), policy()).expect("queue"));

    let snapshot = drive(&queue, engine, |s| !s.failed.is_empty()).await;

    let patches = api.calls().iter().filter(|c| c.starts_with("PATCH")).count();
    assert_eq!(patches, 3, "one PATCH per delivery");
    assert_eq!(snapshot.failed[0].attempts, 3);
    assert!(snapshot.failed[0].last_error.starts_with("patch_failed"));

    let fs = FsStore::new(home.path());
    let record = fs.load(&cfg()).expect("record");
    assert_eq!(record.sync.status, SyncStatus::Error);
    assert_eq!(
        kbsync_daemon::jobs::load_failed_jobs_at(home.path()).expect("dead letters"),
        snapshot.failed
    );
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_redelivery() {
    let home = TempDir::new().expect("home");
    let api = Arc::new(FakeAssistantApi::default().with_assistant("asst-1", classic_assistant()));
    api.script_patch_errors([(502, "bad gateway".to_string())]);
    let engine = engine(&home, api.clone());
    let queue = Arc::new(JobQueue::new(policy()));

    let snapshot = drive(&queue, engine, |s| s.completed == 1).await;

    assert!(snapshot.failed.is_empty());
    assert_eq!(snapshot.last_runs[0].attempt, 2);
    let record = FsStore::new(home.path()).load(&cfg()).expect("record");
    assert_eq!(record.sync.status, SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn manual_review_is_not_redelivered() {
    let home = TempDir::new().expect("home");
    let api = Arc::new(FakeAssistantApi::default().with_assistant("asst-1", json!({"id": "asst-1"})));
    let engine = engine(&home, api.clone());
    let queue = Arc::new(JobQueue::new(policy()));

    let snapshot = drive(&queue, engine, |s| s.completed == 1).await;

    assert_eq!(
        snapshot.last_runs[0].status,
        Some(SyncStatus::NeedsManualReview)
    );
    let gets = api.calls().iter().filter(|c| c.starts_with("GET /assistant")).count();
    assert_eq!(gets, 1);
}
