use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use kbsync_core::store::{config_path_at, list_configs_at, load_config_at, validate_config_id};
use kbsync_core::types::ConfigId;
use kbsync_sync::SyncEngine;

use crate::error::{io_err, DaemonError};
use crate::jobs::{run_worker, JobPolicy, JobQueue, JobRunner, JobSource};
use crate::paths::{configs_root, run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon over the `~/.kbsync` store and the configured backends.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let settings = kbsync_core::settings::load_at(&home)?;
    let queue = JobQueue::persistent_at(&home, JobPolicy::from_settings(&settings))?;
    let engine = SyncEngine::from_home(&home, settings)?;
    run_with(home, Arc::new(queue), Arc::new(engine)).await
}

/// Run watcher, worker and socket server until `stop` or ctrl-c.
pub async fn run_with(
    home: PathBuf,
    queue: Arc<JobQueue>,
    runner: Arc<dyn JobRunner>,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let started_at = Utc::now();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let result = watcher_task(home, queue, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let worker_handle = {
        let shutdown = shutdown_tx.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            run_worker(queue, runner, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            Ok(())
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                queue,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    tracing::info!(home = %home.display(), "kbsync daemon started");
    let (watcher_result, worker_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, worker_handle, socket_handle, signal_handle);

    handle_join("watcher", watcher_result)?;
    handle_join("worker", worker_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("kbsync daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

async fn watcher_task(
    home: PathBuf,
    queue: Arc<JobQueue>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let configs = configs_root(&home);
    if !configs.exists() {
        fs::create_dir_all(&configs).map_err(|e| io_err(&configs, e))?;
    }
    // Event paths arrive canonicalized on some platforms (/private/var on macOS).
    let configs = fs::canonicalize(&configs).unwrap_or(configs);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&configs, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %configs.display(), "watching configuration directory");

    let mut versions = known_versions(&home);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    let Some(id) = config_id_for_path(&path, &configs) else {
                        continue;
                    };
                    // Sync-state writes and editor bursts touch the same file;
                    // only a payload update bumps the version.
                    let version = match load_config_at(&home, &id) {
                        Ok(record) => record.version,
                        Err(err) => {
                            tracing::warn!(config_id = %id, error = %err, "changed configuration unreadable");
                            continue;
                        }
                    };
                    if versions.insert(id.clone(), version) == Some(version) {
                        continue;
                    }
                    tracing::info!(config_id = %id, version, "configuration changed");
                    queue.enqueue(id, JobSource::Watcher);
                }
            }
        }
    }

    Ok(())
}

fn known_versions(home: &Path) -> HashMap<ConfigId, u64> {
    match list_configs_at(home) {
        Ok(records) => records.into_iter().map(|r| (r.id, r.version)).collect(),
        Err(err) => {
            tracing::warn!(error = %err, "could not list configurations at startup");
            HashMap::new()
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// `<configs>/<id>.yaml` → `id`; anything else (temp files, subdirs) → `None`.
fn config_id_for_path(path: &Path, configs: &Path) -> Option<ConfigId> {
    if path.parent() != Some(configs) {
        return None;
    }
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml"))
        .unwrap_or(false);
    if !is_yaml {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(ConfigId::from)
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    home: PathBuf,
    queue: Arc<JobQueue>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let queue = queue.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, home, queue, shutdown_tx, started_at).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    queue: Arc<JobQueue>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = dispatch(&home, &queue, &shutdown_tx, started_at, request);
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

fn dispatch(
    home: &Path,
    queue: &JobQueue,
    shutdown_tx: &broadcast::Sender<()>,
    started_at: DateTime<Utc>,
    request: DaemonRequest,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(home, queue, started_at)),
        "jobs" => match serde_json::to_value(queue.snapshot()) {
            Ok(snapshot) => DaemonResponse::ok(snapshot),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "sync" => {
            let Some(raw) = request.config_id.filter(|id| !id.trim().is_empty()) else {
                return DaemonResponse::error("sync requires a config_id");
            };
            let id = ConfigId::from(raw);
            if let Err(e) = validate_config_id(&id) {
                return DaemonResponse::error(e.to_string());
            }
            let path = config_path_at(home, &id);
            if !path.exists() {
                return DaemonResponse::error(format!(
                    "configuration '{id}' not found at {}",
                    path.display()
                ));
            }
            let queued = queue.enqueue(id.clone(), JobSource::Socket);
            DaemonResponse::ok(json!({ "config_id": id, "queued": queued }))
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn build_status_payload(home: &Path, queue: &JobQueue, started_at: DateTime<Utc>) -> Value {
    let snapshot = queue.snapshot();
    let policy = queue.policy();
    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": started_at.to_rfc3339(),
        "socket": socket_path(home).display().to_string(),
        "configs_root": configs_root(home).display().to_string(),
        "max_attempts": policy.max_attempts,
        "pending": snapshot.pending.len(),
        "in_flight": snapshot.in_flight,
        "completed": snapshot.completed,
        "failed": snapshot.failed.len(),
        "last_runs": snapshot.last_runs,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [configs_root(home), run_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG` filter (default `info`); `KBSYNC_LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("KBSYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
