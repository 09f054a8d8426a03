//! `kbsync daemon`: background job queue and watcher lifecycle.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::Value;

use kbsync_daemon::paths::socket_path;
use kbsync_daemon::{
    request_jobs, request_status, request_stop, request_sync, start_blocking, DaemonError,
};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run daemon in foreground (watcher + job worker + socket server).
    Start,
    /// Request graceful daemon shutdown over Unix socket.
    Stop,
    /// Query daemon runtime status over Unix socket.
    Status,
    /// Queue a sync of one configuration.
    Enqueue {
        /// Configuration id to sync.
        config_id: String,
    },
    /// Show pending, in-flight and failed jobs.
    Jobs,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home_dir()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Enqueue { config_id } => {
            let data = request_sync(&home, &config_id)
                .with_context(|| format!("failed to enqueue '{config_id}'"))?;
            if data["queued"] == Value::Bool(true) {
                println!("✓ sync of '{config_id}' queued");
            } else {
                println!("sync of '{config_id}' already pending");
            }
        }
        DaemonCommand::Jobs => {
            let jobs = request_jobs(&home).context("failed to list daemon jobs")?;
            print_json(&jobs)?;
        }
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon JSON")?
    );
    Ok(())
}
