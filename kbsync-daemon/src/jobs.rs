//! Sync job queue: the contract every orchestrator run happens under.
//!
//! - one unit of work per configuration id, deduplicated while pending
//! - a single worker, so an id is never in flight twice
//! - up to `max_attempts` deliveries, `base × 2^(n-1)` apart after the n-th failure
//! - exhausted jobs move to a dead-letter list persisted to
//!   `~/.kbsync/run/failed_jobs.json`
//!
//! A delivery fails when the engine returns `Err` or finishes with status
//! `error`. `needs_manual_review` completes the job: another delivery would
//! hit the same remote rejection.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use kbsync_core::settings::Settings;
use kbsync_core::types::{ConfigId, SyncStatus};
use kbsync_sync::{PatchOutcome, SyncEngine};

use crate::error::{io_err, DaemonError};
use crate::paths::failed_jobs_path;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes one delivery of a job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// `Err` carries the failure text and schedules another delivery.
    async fn run(&self, id: &ConfigId) -> Result<SyncStatus, String>;
}

#[async_trait]
impl JobRunner for SyncEngine {
    async fn run(&self, id: &ConfigId) -> Result<SyncStatus, String> {
        match self.sync(id).await {
            Ok(report) if report.status == SyncStatus::Error => Err(report
                .patch
                .as_ref()
                .map(PatchOutcome::error_text)
                .unwrap_or_else(|| {
                    format!(
                        "sync finished with status error ({} document(s) failed)",
                        report.failed.len()
                    )
                })),
            Ok(report) => Ok(report.status),
            Err(err) => Err(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy and records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Watcher,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl JobPolicy {
    pub const MIN_ATTEMPTS: u32 = 3;

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.job_max_attempts.max(Self::MIN_ATTEMPTS),
            backoff_base: settings.job_backoff_base(),
        }
    }

    /// Delay before the next delivery once `failed` deliveries have failed.
    pub fn backoff(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// A queued job.
#[derive(Debug, Clone, Serialize)]
pub struct PendingJob {
    pub config_id: ConfigId,
    pub source: JobSource,
    /// Deliveries already made.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip)]
    ready_at: Instant,
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub config_id: ConfigId,
    pub source: JobSource,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of the latest delivery for one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub config_id: ConfigId,
    pub attempt: u32,
    pub status: Option<SyncStatus>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<PendingJob>,
    pub in_flight: Option<ConfigId>,
    pub completed: u64,
    pub failed: Vec<FailedJob>,
    pub last_runs: Vec<JobRun>,
}

// ---------------------------------------------------------------------------
// Dead-letter persistence
// ---------------------------------------------------------------------------

/// Load dead-lettered jobs; a missing file means none.
pub fn load_failed_jobs_at(home: &Path) -> Result<Vec<FailedJob>, DaemonError> {
    let path = failed_jobs_path(home);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(io_err(&path, err)),
    }
}

/// Atomically replace the dead-letter file.
pub fn save_failed_jobs_at(home: &Path, jobs: &[FailedJob]) -> Result<(), DaemonError> {
    let path = failed_jobs_path(home);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(jobs)?;
    fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingJob>,
    in_flight: Option<ConfigId>,
    completed: u64,
    failed: Vec<FailedJob>,
    last_runs: BTreeMap<ConfigId, JobRun>,
}

enum Next {
    Job(PendingJob),
    WaitUntil(Instant),
    Idle,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    policy: JobPolicy,
    home: Option<PathBuf>,
}

impl JobQueue {
    /// In-memory queue; dead letters are not persisted.
    pub fn new(policy: JobPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            policy,
            home: None,
        }
    }

    /// Queue persisting dead letters under `home`, reloading earlier ones.
    pub fn persistent_at(home: &Path, policy: JobPolicy) -> Result<Self, DaemonError> {
        let failed = load_failed_jobs_at(home)?;
        let queue = Self {
            home: Some(home.to_path_buf()),
            ..Self::new(policy)
        };
        lock(&queue.state).failed = failed;
        Ok(queue)
    }

    pub fn policy(&self) -> JobPolicy {
        self.policy
    }

    /// Queue a sync of `id`. Returns `false` when one is already pending.
    pub fn enqueue(&self, id: ConfigId, source: JobSource) -> bool {
        let mut state = lock(&self.state);
        if state.pending.iter().any(|job| job.config_id == id) {
            tracing::debug!(config_id = %id, "sync already pending, coalesced");
            return false;
        }
        tracing::info!(config_id = %id, source = ?source, "sync job queued");
        state.pending.push_back(PendingJob {
            config_id: id,
            source,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            ready_at: Instant::now(),
        });
        drop(state);
        self.wake.notify_one();
        true
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = lock(&self.state);
        QueueSnapshot {
            pending: state.pending.iter().cloned().collect(),
            in_flight: state.in_flight.clone(),
            completed: state.completed,
            failed: state.failed.clone(),
            last_runs: state.last_runs.values().cloned().collect(),
        }
    }

    fn take_ready(&self, now: Instant) -> Next {
        let mut state = lock(&self.state);
        if let Some(idx) = state.pending.iter().position(|job| job.ready_at <= now) {
            if let Some(job) = state.pending.remove(idx) {
                state.in_flight = Some(job.config_id.clone());
                return Next::Job(job);
            }
        }
        match state.pending.iter().map(|job| job.ready_at).min() {
            Some(at) => Next::WaitUntil(at),
            None => Next::Idle,
        }
    }

    fn finish(&self, job: PendingJob, result: Result<SyncStatus, String>) {
        let attempt = job.attempts + 1;
        let mut state = lock(&self.state);
        state.in_flight = None;
        let mut dead_letters_changed = false;

        match result {
            Ok(status) => {
                state.completed += 1;
                let before = state.failed.len();
                state.failed.retain(|f| f.config_id != job.config_id);
                dead_letters_changed = before != state.failed.len();
                tracing::info!(config_id = %job.config_id, attempt, status = %status, "sync job completed");
                state.last_runs.insert(
                    job.config_id.clone(),
                    JobRun {
                        config_id: job.config_id,
                        attempt,
                        status: Some(status),
                        error: None,
                        finished_at: Utc::now(),
                    },
                );
            }
            Err(error) => {
                state.last_runs.insert(
                    job.config_id.clone(),
                    JobRun {
                        config_id: job.config_id.clone(),
                        attempt,
                        status: None,
                        error: Some(error.clone()),
                        finished_at: Utc::now(),
                    },
                );
                let superseded = state
                    .pending
                    .iter()
                    .any(|pending| pending.config_id == job.config_id);
                if attempt < self.policy.max_attempts {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        config_id = %job.config_id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "sync job failed, will retry",
                    );
                    if !superseded {
                        state.pending.push_back(PendingJob {
                            attempts: attempt,
                            last_error: Some(error),
                            ready_at: Instant::now() + delay,
                            ..job
                        });
                    }
                } else {
                    tracing::error!(
                        config_id = %job.config_id,
                        attempts = attempt,
                        error = %error,
                        "sync job exhausted its attempts, moved to failed jobs",
                    );
                    state.failed.retain(|f| f.config_id != job.config_id);
                    state.failed.push(FailedJob {
                        config_id: job.config_id,
                        source: job.source,
                        attempts: attempt,
                        last_error: error,
                        failed_at: Utc::now(),
                    });
                    dead_letters_changed = true;
                }
            }
        }

        let failed = dead_letters_changed.then(|| state.failed.clone());
        drop(state);
        if let (Some(home), Some(failed)) = (&self.home, failed) {
            if let Err(err) = save_failed_jobs_at(home, &failed) {
                tracing::warn!(error = %err, "could not persist failed jobs");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The single worker: delivers ready jobs one at a time until shutdown.
///
/// A delivery in progress is never cancelled; shutdown is observed between
/// deliveries.
pub async fn run_worker(
    queue: Arc<JobQueue>,
    runner: Arc<dyn JobRunner>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        if !matches!(
            shutdown_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ) {
            break;
        }
        match queue.take_ready(Instant::now()) {
            Next::Job(job) => {
                tracing::debug!(config_id = %job.config_id, attempt = job.attempts + 1, "delivering sync job");
                let result = runner.run(&job.config_id).await;
                queue.finish(job, result);
            }
            Next::WaitUntil(at) => {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = queue.wake.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            Next::Idle => {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = queue.wake.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    /// Answers each id from a script; an exhausted script means success.
    #[derive(Default)]
    struct ScriptedRunner {
        script: Mutex<HashMap<ConfigId, VecDeque<Result<SyncStatus, String>>>>,
        calls: Mutex<Vec<(ConfigId, Instant)>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        hold: Duration,
    }

    impl ScriptedRunner {
        fn script(self, id: &str, answers: Vec<Result<SyncStatus, String>>) -> Self {
            lock(&self.script).insert(ConfigId::from(id), answers.into());
            self
        }

        fn calls_for(&self, id: &str) -> Vec<Instant> {
            lock(&self.calls)
                .iter()
                .filter(|(cid, _)| cid.0 == id)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(&self, id: &ConfigId) -> Result<SyncStatus, String> {
            lock(&self.calls).push((id.clone(), Instant::now()));
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            if !self.hold.is_zero() {
                tokio::time::sleep(self.hold).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            lock(&self.script)
                .get_mut(id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(SyncStatus::Synced))
        }
    }

    fn policy() -> JobPolicy {
        JobPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }

    fn spawn_worker(
        queue: &Arc<JobQueue>,
        runner: &Arc<ScriptedRunner>,
    ) -> broadcast::Sender<()> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner: Arc<dyn JobRunner> = runner.clone();
        tokio::spawn(run_worker(queue.clone(), runner, shutdown_rx));
        shutdown_tx
    }

    async fn wait_for(queue: &JobQueue, done: impl Fn(&QueueSnapshot) -> bool) {
        for _ in 0..2_000 {
            if done(&queue.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("queue never reached the expected state: {:?}", queue.snapshot());
    }

    #[test]
    fn backoff_doubles_from_the_base() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn policy_never_allows_fewer_than_three_attempts() {
        let settings = Settings {
            job_max_attempts: 1,
            ..Settings::default()
        };
        assert_eq!(JobPolicy::from_settings(&settings).max_attempts, 3);
    }

    #[tokio::test]
    async fn pending_key_is_deduplicated() {
        let queue = JobQueue::new(policy());
        assert!(queue.enqueue(ConfigId::from("a"), JobSource::Watcher));
        assert!(!queue.enqueue(ConfigId::from("a"), JobSource::Socket));
        assert!(queue.enqueue(ConfigId::from("b"), JobSource::Socket));
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.pending.len(), 2);
        assert_eq!(snapshot.pending[0].source, JobSource::Watcher);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_deliveries_back_off_exponentially() {
        let queue = Arc::new(JobQueue::new(policy()));
        let runner = Arc::new(ScriptedRunner::default().script(
            "a",
            vec![Err("patch_failed: 500".into()), Err("patch_failed: 500".into())],
        ));
        let shutdown = spawn_worker(&queue, &runner);

        queue.enqueue(ConfigId::from("a"), JobSource::Socket);
        wait_for(&queue, |s| s.completed == 1).await;

        let calls = runner.calls_for("a");
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_secs(2) && first_gap < Duration::from_millis(2_100));
        assert!(second_gap >= Duration::from_secs(4) && second_gap < Duration::from_millis(4_100));

        let snapshot = queue.snapshot();
        assert!(snapshot.failed.is_empty());
        assert_eq!(snapshot.last_runs[0].attempt, 3);
        assert_eq!(snapshot.last_runs[0].status, Some(SyncStatus::Synced));
        let _ = shutdown.send(());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_is_dead_lettered_and_persisted() {
        let home = TempDir::new().expect("home");
        let queue = Arc::new(JobQueue::persistent_at(home.path(), policy()).expect("queue"));
        let runner = Arc::new(ScriptedRunner::default().script(
            "a",
            vec![Err("one".into()), Err("two".into()), Err("three".into())],
        ));
        let shutdown = spawn_worker(&queue, &runner);

        queue.enqueue(ConfigId::from("a"), JobSource::Watcher);
        wait_for(&queue, |s| !s.failed.is_empty()).await;

        assert_eq!(runner.calls_for("a").len(), 3);
        let snapshot = queue.snapshot();
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.failed[0].attempts, 3);
        assert_eq!(snapshot.failed[0].last_error, "three");

        let persisted = load_failed_jobs_at(home.path()).expect("load");
        assert_eq!(persisted, snapshot.failed);

        let reloaded = JobQueue::persistent_at(home.path(), policy()).expect("reload");
        assert_eq!(reloaded.snapshot().failed.len(), 1);
        let _ = shutdown.send(());
    }

    #[tokio::test(start_paused = true)]
    async fn later_success_clears_the_dead_letter() {
        let home = TempDir::new().expect("home");
        save_failed_jobs_at(
            home.path(),
            &[FailedJob {
                config_id: ConfigId::from("a"),
                source: JobSource::Watcher,
                attempts: 3,
                last_error: "boom".into(),
                failed_at: Utc::now(),
            }],
        )
        .expect("seed");
        let queue = Arc::new(JobQueue::persistent_at(home.path(), policy()).expect("queue"));
        let runner = Arc::new(ScriptedRunner::default());
        let shutdown = spawn_worker(&queue, &runner);

        queue.enqueue(ConfigId::from("a"), JobSource::Socket);
        wait_for(&queue, |s| s.completed == 1).await;

        assert!(queue.snapshot().failed.is_empty());
        assert!(load_failed_jobs_at(home.path()).expect("load").is_empty());
        let _ = shutdown.send(());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_review_completes_without_retry() {
        let queue = Arc::new(JobQueue::new(policy()));
        let runner = Arc::new(
            ScriptedRunner::default().script("a", vec![Ok(SyncStatus::NeedsManualReview)]),
        );
        let shutdown = spawn_worker(&queue, &runner);

        queue.enqueue(ConfigId::from("a"), JobSource::Socket);
        wait_for(&queue, |s| s.completed == 1).await;

        assert_eq!(runner.calls_for("a").len(), 1);
        assert!(queue.snapshot().failed.is_empty());
        let _ = shutdown.send(());
    }

    #[tokio::test(start_paused = true)]
    async fn single_worker_never_runs_two_jobs_at_once() {
        let queue = Arc::new(JobQueue::new(policy()));
        let runner = Arc::new(ScriptedRunner {
            hold: Duration::from_secs(1),
            ..ScriptedRunner::default()
        });
        let shutdown = spawn_worker(&queue, &runner);

        queue.enqueue(ConfigId::from("a"), JobSource::Socket);
        queue.enqueue(ConfigId::from("b"), JobSource::Socket);
        wait_for(&queue, |s| s.in_flight.is_some()).await;
        // `a` is in flight, so this is a fresh job rather than a duplicate.
        queue.enqueue(ConfigId::from("a"), JobSource::Watcher);
        wait_for(&queue, |s| s.completed == 3).await;

        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(runner.calls_for("a").len(), 2);
        let _ = shutdown.send(());
    }
}
