//! Sync orchestrator: drives one configuration through a sync attempt.
//!
//! ## Sequence
//!
//! 1. status `syncing`, last error cleared
//! 2. snapshot the current file records (the old generation)
//! 3. generate documents; nothing generated → status `idle`, done
//! 4. stage to a scratch dir and publish every document to both backends
//! 5. persist every new file record, partial failures included
//! 6. no remote assistant → stop here, status stays `syncing`
//! 7. patch protocol with the attachable (vendor-hosted) file ids
//! 8. success → `synced`, then retire the old generation;
//!    schema problems → `needs_manual_review`; anything else → `error`
//!
//! Each successful attach replaces the query tool of the previous one in
//! the same PATCH, so `model.toolIds` only ever names the live generation.
//!
//! The old generation is deleted only after the new one is attached. Any
//! error escaping the sequence sets status `error` before it is returned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use kbsync_core::settings::Settings;
use kbsync_core::store::{ConfigStore, FileRecordStore, FsStore};
use kbsync_core::types::{
    ConfigId, ConfigurationRecord, FileRecord, SyncState, SyncStatus,
};
use kbsync_renderer::{Generator, ScratchDir};

use crate::api::{AssistantApi, HttpAssistantApi};
use crate::diff::{diff_documents, ConfigDiff};
use crate::error::SyncError;
use crate::object_store::{self, ObjectStore};
use crate::patch::{AttachRequest, PatchOutcome, PatchProtocol};
use crate::publisher::{PublishOutcome, Publisher, Targets};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Summary of one sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub config_id: ConfigId,
    /// `None` when nothing was generated.
    pub generation: Option<String>,
    pub status: SyncStatus,
    pub documents: usize,
    /// Documents held by both backends.
    pub published: usize,
    /// Names of documents held by exactly one backend.
    pub degraded: Vec<String>,
    /// Names of documents held by neither backend.
    pub failed: Vec<String>,
    pub patch: Option<PatchOutcome>,
    /// Old-generation records retired after a successful attach.
    pub deleted_records: usize,
    /// Remote deletions that failed during retirement.
    pub cleanup_errors: Vec<String>,
}

impl SyncReport {
    fn new(config_id: &ConfigId) -> Self {
        Self {
            config_id: config_id.clone(),
            generation: None,
            status: SyncStatus::Syncing,
            documents: 0,
            published: 0,
            degraded: Vec::new(),
            failed: Vec::new(),
            patch: None,
            deleted_records: 0,
            cleanup_errors: Vec::new(),
        }
    }
}

/// Summary of [`SyncEngine::retry_failed_uploads`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryReport {
    pub config_id: ConfigId,
    pub generation: Option<String>,
    /// Records that had a missing half and were republished.
    pub retried: usize,
    /// Records now held by both backends.
    pub recovered: usize,
    pub still_failing: Vec<String>,
    /// Records whose content changed since upload; left for a full sync.
    pub skipped_changed: Vec<String>,
    /// Sync status after the retry.
    pub status: SyncStatus,
    /// Re-attach run because new vendor copies became available.
    pub patch: Option<PatchOutcome>,
    /// Older-generation records retired after a successful re-attach.
    pub deleted_records: usize,
    pub cleanup_errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// The sync orchestrator with its collaborators injected.
///
/// Cheap to share behind an `Arc`; concurrent [`SyncEngine::sync`] calls for
/// the same configuration id are serialized by a per-id lock.
pub struct SyncEngine {
    configs: Arc<dyn ConfigStore>,
    files: Arc<dyn FileRecordStore>,
    api: Arc<dyn AssistantApi>,
    objects: Arc<dyn ObjectStore>,
    generator: Generator,
    settings: Settings,
    scratch_parent: Option<PathBuf>,
    locks: Mutex<HashMap<ConfigId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        files: Arc<dyn FileRecordStore>,
        api: Arc<dyn AssistantApi>,
        objects: Arc<dyn ObjectStore>,
        settings: Settings,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            configs,
            files,
            api,
            objects,
            generator: Generator::new()?,
            settings,
            scratch_parent: None,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Engine over the `~/.kbsync` file store and the HTTP backends.
    pub fn from_home(home: &Path, settings: Settings) -> Result<Self, SyncError> {
        let store = Arc::new(FsStore::new(home));
        let api = Arc::new(HttpAssistantApi::new(&settings)?);
        let objects = object_store::from_settings(&settings, home)?;
        let templates = kbsync_core::store::root_at(home).join("templates");
        let mut engine = Self::new(store.clone(), store, api, objects, settings)?;
        if templates.is_dir() {
            engine.generator = Generator::with_templates(&templates)?;
        }
        Ok(engine)
    }

    /// Stage documents under `dir` instead of the system temp dir.
    pub fn with_scratch_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(dir.into());
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn lock_for(&self, id: &ConfigId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    fn scratch(&self) -> Result<ScratchDir, SyncError> {
        Ok(match &self.scratch_parent {
            Some(parent) => ScratchDir::new_in(parent)?,
            None => ScratchDir::new()?,
        })
    }

    fn save_state(&self, id: &ConfigId, state: &SyncState) -> Result<(), SyncError> {
        self.configs.save_sync_state(id, state)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // sync
    // -----------------------------------------------------------------------

    /// Run one sync attempt for `id`.
    ///
    /// Terminal outcomes of the attach step (`synced`, `error`,
    /// `needs_manual_review`) are reported through [`SyncReport::status`];
    /// `Err` means the sequence itself broke (store, render or staging).
    pub async fn sync(&self, id: &ConfigId) -> Result<SyncReport, SyncError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.configs.load(id)?;
        let mut state = record.sync.clone();
        state.status = SyncStatus::Syncing;
        state.last_error = None;
        self.save_state(id, &state)?;
        tracing::info!("sync {id}: started (version {})", record.version);

        match self.run(&record, &mut state).await {
            Ok(report) => {
                tracing::info!("sync {id}: finished with status {}", report.status);
                Ok(report)
            }
            Err(e) => {
                tracing::error!("sync {id}: {e}");
                state.status = SyncStatus::Error;
                state.last_error = Some(e.to_string());
                if let Err(save_err) = self.save_state(id, &state) {
                    tracing::error!("sync {id}: could not record failure: {save_err}");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        record: &ConfigurationRecord,
        state: &mut SyncState,
    ) -> Result<SyncReport, SyncError> {
        let id = &record.id;
        let mut report = SyncReport::new(id);

        let old_generation = self.files.find_by_config(id)?;
        let documents = self.generator.generate(record)?;
        report.documents = documents.len();
        if documents.is_empty() {
            tracing::info!("sync {id}: nothing to publish");
            state.status = SyncStatus::Idle;
            self.save_state(id, state)?;
            report.status = SyncStatus::Idle;
            return Ok(report);
        }

        let generation = new_generation_id(&old_generation);
        let published = {
            let scratch = self.scratch()?;
            let staged = scratch.stage(&documents)?;
            Publisher::new(self.api.as_ref(), self.objects.as_ref())
                .publish_all(&record.business.id, &staged)
                .await
        };

        let now = Utc::now();
        let records: Vec<FileRecord> = published
            .iter()
            .map(|p| p.to_record(record, &generation, now))
            .collect();
        self.files.create(id, &records)?;

        for doc in &published {
            match doc.outcome() {
                PublishOutcome::Complete => report.published += 1,
                PublishOutcome::Degraded => report.degraded.push(doc.document.name.clone()),
                PublishOutcome::Failed => report.failed.push(doc.document.name.clone()),
            }
        }
        report.generation = Some(generation);

        let Some(assistant_id) = record.business.assistant_id.as_deref() else {
            tracing::info!("sync {id}: no remote assistant yet, attach skipped");
            report.status = SyncStatus::Syncing;
            return Ok(report);
        };

        let file_ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.vendor.vendor_id().map(str::to_string))
            .collect();
        if file_ids.is_empty() {
            let message = format!(
                "no attachable files: {} document(s) failed to reach the vendor store",
                records.len()
            );
            tracing::error!("sync {id}: {message}");
            state.status = SyncStatus::Error;
            state.last_error = Some(message);
            self.save_state(id, state)?;
            report.status = SyncStatus::Error;
            return Ok(report);
        }

        let outcome = self.attach(record, state, assistant_id, &file_ids).await;
        self.record_outcome(id, state, &outcome)?;
        if outcome.success {
            let live_keys: Vec<String> =
                records.iter().filter_map(|r| r.object_key.clone()).collect();
            let (deleted, errors) = self.retire(id, &old_generation, &live_keys).await;
            report.deleted_records = deleted;
            report.cleanup_errors = errors;
        }

        report.status = state.status;
        report.patch = Some(outcome);
        Ok(report)
    }

    /// Run the patch protocol for `file_ids`, replacing the query tool of the
    /// last successful attach.
    async fn attach(
        &self,
        record: &ConfigurationRecord,
        state: &SyncState,
        assistant_id: &str,
        file_ids: &[String],
    ) -> PatchOutcome {
        let superseded: Vec<String> = state.query_tool_id.iter().cloned().collect();
        PatchProtocol::new(self.api.as_ref(), &self.settings)
            .attach(AttachRequest {
                assistant_id,
                business_name: &record.business.name,
                file_ids,
                tool_ids: &[],
                superseded_tool_ids: &superseded,
            })
            .await
    }

    /// Map a patch outcome onto the terminal sync status and persist it.
    fn record_outcome(
        &self,
        id: &ConfigId,
        state: &mut SyncState,
        outcome: &PatchOutcome,
    ) -> Result<(), SyncError> {
        if outcome.detected_schema.is_some() {
            state.remote_schema = outcome.detected_schema;
        }
        if outcome.success {
            state.status = SyncStatus::Synced;
            state.last_synced_at = Some(Utc::now());
            state.last_error = None;
            if outcome.query_tool_id.is_some() {
                state.query_tool_id = outcome.query_tool_id.clone();
            }
        } else if outcome.reason.needs_manual_review() {
            tracing::warn!("sync {id}: {}, queued for manual review", outcome.reason);
            state.status = SyncStatus::NeedsManualReview;
            state.last_error = Some(
                outcome
                    .remote_response
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| outcome.reason.to_string()),
            );
        } else {
            state.status = SyncStatus::Error;
            state.last_error = Some(outcome.error_text());
        }
        self.save_state(id, state)
    }

    /// Drop `old` from the record store, then delete its remote copies.
    ///
    /// Runs after `synced` is committed, so nothing here may change the
    /// status: failures are logged and returned as cleanup errors. Records go
    /// first; if that fails the remote files are kept so that no record ever
    /// points at a deleted vendor file. Object keys are per file name, so keys
    /// the new generation just wrote (`live_keys`) are left alone.
    async fn retire(
        &self,
        id: &ConfigId,
        old: &[FileRecord],
        live_keys: &[String],
    ) -> (usize, Vec<String>) {
        if old.is_empty() {
            return (0, Vec::new());
        }
        let record_ids: Vec<String> = old.iter().map(FileRecord::record_id).collect();
        if let Err(e) = self.files.delete(id, &record_ids) {
            let message = format!("record store: could not retire old generation: {e}");
            tracing::warn!("sync {id}: {message}; remote copies kept");
            return (0, vec![message]);
        }
        tracing::info!("sync {id}: retired {} old record(s)", record_ids.len());

        let results = join_all(old.iter().map(|r| async move {
            let mut errors = Vec::new();
            if let Some(file_id) = r.vendor.vendor_id() {
                if let Err(e) = self.api.delete_file(file_id).await {
                    errors.push(format!("{}: vendor delete failed: {e}", r.display_name));
                }
            }
            if let Some(key) = r.object_key.as_ref().filter(|k| !live_keys.contains(k)) {
                if let Err(e) = self.objects.delete(key).await {
                    errors.push(format!("{}: object delete failed: {e}", r.display_name));
                }
            }
            errors
        }))
        .await;
        let errors: Vec<String> = results.into_iter().flatten().collect();
        for e in &errors {
            tracing::warn!("sync {id}: {e}");
        }
        (record_ids.len(), errors)
    }

    // -----------------------------------------------------------------------
    // retry_failed_uploads
    // -----------------------------------------------------------------------

    /// Republish the missing backend half of the latest generation's records.
    ///
    /// Content is regenerated; a record is only retried when the fresh
    /// document still hashes to the recorded SHA-256. When a vendor copy is
    /// recovered and the business has an assistant, the whole generation is
    /// attached again and the status is mapped as in [`SyncEngine::sync`].
    pub async fn retry_failed_uploads(&self, id: &ConfigId) -> Result<RetryReport, SyncError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.configs.load(id)?;
        let all = self.files.find_by_config(id)?;
        let mut report = RetryReport {
            config_id: id.clone(),
            generation: latest_generation(&all),
            retried: 0,
            recovered: 0,
            still_failing: Vec::new(),
            skipped_changed: Vec::new(),
            status: record.sync.status,
            patch: None,
            deleted_records: 0,
            cleanup_errors: Vec::new(),
        };
        let Some(generation) = report.generation.clone() else {
            return Ok(report);
        };

        let pending: Vec<&FileRecord> = all
            .iter()
            .filter(|r| r.generation == generation && r.needs_retry())
            .collect();
        if pending.is_empty() {
            return Ok(report);
        }

        let documents = self.generator.generate(&record)?;
        let mut retry = Vec::new();
        for r in pending {
            let fresh = documents.iter().find(|d| {
                d.section == r.section
                    && crate::publisher::content_sha256(d.content.as_bytes()) == r.content_sha256
            });
            match fresh {
                Some(doc) => retry.push((r.clone(), doc.clone())),
                None => report.skipped_changed.push(r.display_name.clone()),
            }
        }
        if retry.is_empty() {
            return Ok(report);
        }

        let scratch = self.scratch()?;
        let docs: Vec<_> = retry.iter().map(|(_, d)| d.clone()).collect();
        let staged = scratch.stage(&docs)?;
        let publisher = Publisher::new(self.api.as_ref(), self.objects.as_ref());
        let results = join_all(retry.iter().zip(&staged).map(|((r, _), s)| {
            let targets = Targets {
                vendor: r.vendor.is_retry_eligible(),
                object_store: r.object_key.is_none(),
            };
            publisher.publish(&record.business.id, s, targets)
        }))
        .await;
        drop(scratch);

        let mut updated = Vec::with_capacity(retry.len());
        let mut vendor_recovered = false;
        for ((mut r, _), result) in retry.into_iter().zip(results) {
            if r.vendor.is_retry_eligible() {
                r.vendor = result.vendor;
                vendor_recovered |= r.vendor.vendor_id().is_some();
            }
            if r.object_key.is_none() {
                r.object_key = result.object_key;
            }
            report.retried += 1;
            if r.needs_retry() {
                report.still_failing.push(r.display_name.clone());
            } else {
                report.recovered += 1;
            }
            updated.push(r);
        }
        self.files.update(id, &updated)?;
        tracing::info!(
            "retry {id}: {} retried, {} recovered, {} still failing",
            report.retried,
            report.recovered,
            report.still_failing.len()
        );

        let Some(assistant_id) = record.business.assistant_id.as_deref() else {
            return Ok(report);
        };
        if !vendor_recovered {
            return Ok(report);
        }

        let mut state = record.sync.clone();
        state.status = SyncStatus::Syncing;
        state.last_error = None;
        self.save_state(id, &state)?;
        match self
            .reattach(&record, &mut state, assistant_id, &generation, &mut report)
            .await
        {
            Ok(()) => Ok(report),
            Err(e) => {
                tracing::error!("retry {id}: {e}");
                state.status = SyncStatus::Error;
                state.last_error = Some(e.to_string());
                if let Err(save_err) = self.save_state(id, &state) {
                    tracing::error!("retry {id}: could not record failure: {save_err}");
                }
                Err(e)
            }
        }
    }

    /// Attach every vendor copy of `generation`; on success retire the
    /// generations before it.
    async fn reattach(
        &self,
        record: &ConfigurationRecord,
        state: &mut SyncState,
        assistant_id: &str,
        generation: &str,
        report: &mut RetryReport,
    ) -> Result<(), SyncError> {
        let id = &record.id;
        let (current, older): (Vec<FileRecord>, Vec<FileRecord>) = self
            .files
            .find_by_config(id)?
            .into_iter()
            .partition(|r| r.generation == generation);
        let file_ids: Vec<String> = current
            .iter()
            .filter_map(|r| r.vendor.vendor_id().map(str::to_string))
            .collect();
        tracing::info!("retry {id}: re-attaching {} file(s)", file_ids.len());

        let outcome = self.attach(record, state, assistant_id, &file_ids).await;
        self.record_outcome(id, state, &outcome)?;
        if outcome.success {
            let live_keys: Vec<String> =
                current.iter().filter_map(|r| r.object_key.clone()).collect();
            let (deleted, errors) = self.retire(id, &older, &live_keys).await;
            report.deleted_records = deleted;
            report.cleanup_errors = errors;
        }
        report.status = state.status;
        report.patch = Some(outcome);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // diff
    // -----------------------------------------------------------------------

    /// Compare freshly generated documents with their archived copies.
    pub async fn diff(&self, id: &ConfigId) -> Result<ConfigDiff, SyncError> {
        let record = self.configs.load(id)?;
        let documents = self.generator.generate(&record)?;
        diff_documents(&record, &documents, self.objects.as_ref()).await
    }
}

/// Timestamp-derived generation id, unique among `existing`.
fn new_generation_id(existing: &[FileRecord]) -> String {
    let base = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
    let taken = |g: &str| existing.iter().any(|r| r.generation == g);
    if !taken(&base) {
        return base;
    }
    (1..)
        .map(|n| format!("{base}-{n}"))
        .find(|g| !taken(g))
        .unwrap_or(base)
}

/// Generation of the most recently created record.
fn latest_generation(records: &[FileRecord]) -> Option<String> {
    records
        .iter()
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.generation.cmp(&b.generation))
        })
        .map(|r| r.generation.clone())
}
