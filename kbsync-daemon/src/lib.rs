//! kbsync daemon: sync job queue, configuration watcher and socket server.
//!
//! - [`jobs`]: the job contract (dedup, single worker, backoff, dead letters)
//! - [`protocol`]: newline-delimited JSON over `~/.kbsync/run/daemon.sock`
//! - [`paths`]: runtime file locations

mod error;
pub mod jobs;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use jobs::{FailedJob, JobPolicy, JobQueue, JobRunner, JobSource, QueueSnapshot};
pub use protocol::{
    request_jobs, request_status, request_stop, request_sync, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, run_with, start_blocking};
