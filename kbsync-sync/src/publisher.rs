//! Dual-backend publisher.
//!
//! Every staged document goes to the vendor file store and the object store
//! at the same time. All `2 × N` calls are started together and joined with
//! [`join_all`], which never short-circuits: one failing document cannot
//! cancel a sibling's in-flight uploads.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sha2::{Digest, Sha256};

use kbsync_core::types::{BusinessId, ConfigurationRecord, FileRecord, UploadState};
use kbsync_renderer::{GeneratedDocument, StagedDocument};

use crate::api::AssistantApi;
use crate::object_store::{object_key, ObjectStore};

/// SHA-256 of `bytes`, lowercase hex.
pub fn content_sha256(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// How one document fared across both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Both backends hold a copy.
    Complete,
    /// Exactly one backend holds a copy.
    Degraded,
    /// Neither backend holds a copy.
    Failed,
}

/// Result of publishing one document.
#[derive(Debug, Clone)]
pub struct PublishedDocument {
    pub document: GeneratedDocument,
    pub vendor: UploadState,
    pub object_key: Option<String>,
    /// Error text of the object-store half, if it failed.
    pub object_error: Option<String>,
    pub content_sha256: String,
}

impl PublishedDocument {
    pub fn outcome(&self) -> PublishOutcome {
        match (self.vendor.vendor_id().is_some(), self.object_key.is_some()) {
            (true, true) => PublishOutcome::Complete,
            (false, false) => PublishOutcome::Failed,
            _ => PublishOutcome::Degraded,
        }
    }

    /// Turn the outcome into the persisted record for `generation`.
    pub fn to_record(
        &self,
        record: &ConfigurationRecord,
        generation: &str,
        created_at: DateTime<Utc>,
    ) -> FileRecord {
        FileRecord {
            config_id: record.id.clone(),
            generation: generation.to_string(),
            section: self.document.section,
            display_name: self.document.name.clone(),
            mime_type: self.document.mime_type.to_string(),
            byte_size: self.document.byte_size(),
            content_sha256: self.content_sha256.clone(),
            config_version: record.version,
            vendor: self.vendor.clone(),
            object_key: self.object_key.clone(),
            created_at,
        }
    }
}

/// Which halves of a document still need publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub vendor: bool,
    pub object_store: bool,
}

impl Targets {
    pub const BOTH: Targets = Targets {
        vendor: true,
        object_store: true,
    };
}

/// Publishes staged documents to both backends.
pub struct Publisher<'a> {
    api: &'a dyn AssistantApi,
    store: &'a dyn ObjectStore,
}

impl<'a> Publisher<'a> {
    pub fn new(api: &'a dyn AssistantApi, store: &'a dyn ObjectStore) -> Self {
        Self { api, store }
    }

    /// Publish every document to both backends concurrently.
    ///
    /// Results come back in input order, one per document.
    pub async fn publish_all(
        &self,
        business: &BusinessId,
        staged: &[StagedDocument],
    ) -> Vec<PublishedDocument> {
        join_all(
            staged
                .iter()
                .map(|doc| self.publish(business, doc, Targets::BOTH)),
        )
        .await
    }

    /// Publish one document to the selected backends.
    ///
    /// Halves that are not selected come back as `Pending` / `None`; the
    /// caller merges them with what it already holds.
    pub async fn publish(
        &self,
        business: &BusinessId,
        staged: &StagedDocument,
        targets: Targets,
    ) -> PublishedDocument {
        let document = staged.document.clone();
        let content = match tokio::fs::read(&staged.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = format!("read {}: {e}", staged.path.display());
                tracing::error!("publish {}: {reason}", document.name);
                return PublishedDocument {
                    content_sha256: content_sha256(document.content.as_bytes()),
                    document,
                    vendor: UploadState::Failed {
                        reason: reason.clone(),
                    },
                    object_key: None,
                    object_error: Some(reason),
                };
            }
        };
        let sha = content_sha256(&content);
        let key = object_key(business, &document.name);

        let vendor_call = async {
            if !targets.vendor {
                return None;
            }
            Some(
                self.api
                    .upload_file(&document.name, document.mime_type, content.clone())
                    .await,
            )
        };
        let store_call = async {
            if !targets.object_store {
                return None;
            }
            Some(
                self.store
                    .put(&key, content.clone(), document.mime_type)
                    .await,
            )
        };
        let (vendor_result, store_result) = tokio::join!(vendor_call, store_call);

        let vendor = match vendor_result {
            None => UploadState::Pending,
            Some(Ok(id)) => UploadState::Uploaded { id },
            Some(Err(e)) => UploadState::Failed {
                reason: e.to_string(),
            },
        };
        let (object_key, object_error) = match store_result {
            None => (None, None),
            Some(Ok(())) => (Some(key), None),
            Some(Err(e)) => (None, Some(e.to_string())),
        };

        let published = PublishedDocument {
            document,
            vendor,
            object_key,
            object_error,
            content_sha256: sha,
        };
        log_outcome(&published, targets);
        published
    }
}

fn log_outcome(doc: &PublishedDocument, targets: Targets) {
    let name = &doc.document.name;
    if targets != Targets::BOTH {
        tracing::info!("republished {name}: vendor={:?} object_key={:?}", doc.vendor, doc.object_key);
        return;
    }
    match doc.outcome() {
        PublishOutcome::Complete => tracing::info!("published {name} to both backends"),
        PublishOutcome::Degraded => {
            if let UploadState::Failed { reason } = &doc.vendor {
                tracing::warn!("degraded publish of {name}: vendor upload failed ({reason}); not attachable");
            }
            if let Some(reason) = &doc.object_error {
                tracing::warn!("degraded publish of {name}: object store put failed ({reason})");
            }
        }
        PublishOutcome::Failed => {
            tracing::error!("publish of {name} failed on both backends");
        }
    }
}
