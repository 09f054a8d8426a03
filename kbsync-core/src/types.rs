//! Domain types for the knowledge base sync engine.
//!
//! All types are serializable/deserializable via serde; configuration records
//! are stored as YAML and file records as JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of a configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId(pub String);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ConfigId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConfigId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of the business that owns a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessId(pub String);

impl BusinessId {
    /// Form safe for file names and object-store keys.
    pub fn sanitized(&self) -> String {
        sanitize_business_id(&self.0)
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for BusinessId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BusinessId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// An empty input becomes `"_"` so generated keys never have an empty segment.
pub fn sanitize_business_id(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Sync status of a configuration record.
///
/// `Idle → Syncing → {Synced | Error | NeedsManualReview}`; the two failure
/// states may re-enter `Syncing` on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
    NeedsManualReview,
}

impl SyncStatus {
    /// Whether an attempt in this state has finished (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Synced | SyncStatus::Error | SyncStatus::NeedsManualReview
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Error => write!(f, "error"),
            SyncStatus::NeedsManualReview => write!(f, "needs_manual_review"),
        }
    }
}

/// Shape exposed by the remote assistant resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteSchema {
    /// Both a model configuration and a knowledge-base field are present.
    Classic,
    /// Only one of the two is present.
    Inline,
}

impl fmt::Display for RemoteSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteSchema::Classic => write!(f, "classic"),
            RemoteSchema::Inline => write!(f, "inline"),
        }
    }
}

/// Logical section of a configuration that becomes one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSection {
    PricingAvailability,
    Establishment,
    Supplementary,
    Faq,
    PhotoIndex,
}

impl DocumentSection {
    /// All sections in generation order.
    pub fn all() -> &'static [DocumentSection] {
        &[
            DocumentSection::PricingAvailability,
            DocumentSection::Establishment,
            DocumentSection::Supplementary,
            DocumentSection::Faq,
            DocumentSection::PhotoIndex,
        ]
    }

    /// Stable slug used in file names and record ids.
    pub fn slug(&self) -> &'static str {
        match self {
            DocumentSection::PricingAvailability => "pricing_availability",
            DocumentSection::Establishment => "establishment",
            DocumentSection::Supplementary => "supplementary",
            DocumentSection::Faq => "faq",
            DocumentSection::PhotoIndex => "photo_index",
        }
    }

    /// Payload keys that feed this section.
    pub fn payload_keys(&self) -> &'static [&'static str] {
        match self {
            DocumentSection::PricingAvailability => &["pricing", "availability"],
            DocumentSection::Establishment => &["establishment"],
            DocumentSection::Supplementary => &["supplementary"],
            DocumentSection::Faq => &["faq"],
            DocumentSection::PhotoIndex => &["photos"],
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentSection::PhotoIndex => "application/json",
            _ => "text/markdown",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentSection::PhotoIndex => "json",
            _ => "md",
        }
    }
}

impl fmt::Display for DocumentSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Vendor-store upload state of one generated document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadState {
    /// Not attempted yet.
    Pending,
    /// Hosted by the vendor under `id`.
    Uploaded { id: String },
    /// The upload failed in this generation; eligible for retry.
    Failed { reason: String },
}

impl UploadState {
    /// Vendor file id, only when the upload succeeded.
    pub fn vendor_id(&self) -> Option<&str> {
        match self {
            UploadState::Uploaded { id } if !id.is_empty() => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn is_retry_eligible(&self) -> bool {
        !matches!(self, UploadState::Uploaded { .. })
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// The business that owns a configuration, loaded eagerly with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: BusinessId,
    pub name: String,
    /// Remote assistant resource id, once one has been provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
}

/// Fields of a configuration record owned by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncState {
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_schema: Option<RemoteSchema>,
    /// Query tool attached by the last successful attach; replaced on the
    /// next one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_tool_id: Option<String>,
}

/// A business's structured assistant setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRecord {
    pub id: ConfigId,
    pub business: Business,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    /// Incremented by every payload update.
    pub version: u64,
    /// Opaque nested configuration document.
    pub payload: Value,
    #[serde(default)]
    pub sync: SyncState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted metadata for one generated document of one sync generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub config_id: ConfigId,
    /// Shared by every record produced by the same sync attempt.
    pub generation: String,
    pub section: DocumentSection,
    pub display_name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub content_sha256: String,
    /// Configuration version active at upload time.
    pub config_version: u64,
    pub vendor: UploadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Unique id within a configuration: `<generation>:<section>`.
    pub fn record_id(&self) -> String {
        format!("{}:{}", self.generation, self.section.slug())
    }

    /// True when the vendor copy exists and can be attached.
    pub fn is_attachable(&self) -> bool {
        self.vendor.vendor_id().is_some()
    }

    /// True when at least one backend copy is missing.
    pub fn needs_retry(&self) -> bool {
        self.vendor.is_retry_eligible() || self.object_key.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
