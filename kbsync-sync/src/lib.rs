//! # kbsync-sync
//!
//! Publishing and attachment half of the knowledge-base sync engine.
//!
//! - [`publisher`] uploads each generated document to the vendor file store
//!   and the object store concurrently
//! - [`patch`] attaches the uploaded files to the remote assistant
//! - [`orchestrator`] sequences a full attempt and retires old generations
//!
//! Call [`SyncEngine::sync`] for one configuration id; the daemon and the CLI
//! both go through it.

pub mod api;
pub mod diff;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod fakes;
pub mod object_store;
pub mod orchestrator;
pub mod patch;
pub mod publisher;

pub use api::{AssistantApi, HttpAssistantApi, QueryToolRequest};
pub use diff::{ConfigDiff, DocumentDiff};
pub use error::{ApiError, ObjectStoreError, SyncError};
pub use object_store::{object_key, HttpObjectStore, LocalObjectStore, ObjectStore};
pub use orchestrator::{RetryReport, SyncEngine, SyncReport};
pub use patch::{PatchOutcome, PatchReason, Verification};
pub use publisher::{content_sha256, PublishOutcome, PublishedDocument, Publisher};
