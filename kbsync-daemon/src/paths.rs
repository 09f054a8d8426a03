use std::path::{Path, PathBuf};

use kbsync_core::store::{configs_dir_at, root_at};

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const FAILED_JOBS_FILE: &str = "failed_jobs.json";

pub fn configs_root(home: &Path) -> PathBuf {
    configs_dir_at(home)
}

pub fn run_dir(home: &Path) -> PathBuf {
    root_at(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}

/// Dead-letter file of jobs that exhausted their attempts.
pub fn failed_jobs_path(home: &Path) -> PathBuf {
    run_dir(home).join(FAILED_JOBS_FILE)
}
