//! Client settings injected into the vendor and object-store clients.
//!
//! Loaded once from `~/.kbsync/config.yaml`, then overridden by environment
//! variables. Nothing reads the environment after construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::store::root_at;

pub const ENV_VENDOR_API_KEY: &str = "KBSYNC_VENDOR_API_KEY";
pub const ENV_VENDOR_BASE_URL: &str = "KBSYNC_VENDOR_BASE_URL";
pub const ENV_OBJECT_STORE_URL: &str = "KBSYNC_OBJECT_STORE_URL";
pub const ENV_OBJECT_STORE_TOKEN: &str = "KBSYNC_OBJECT_STORE_TOKEN";
pub const ENV_OBJECT_STORE_ROOT: &str = "KBSYNC_OBJECT_STORE_ROOT";

/// Where archived copies of generated documents go.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectStoreSettings {
    /// S3-compatible HTTP endpoint: `PUT/GET/DELETE/HEAD {base_url}/{key}`.
    Http {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Plain directory; keys map to relative paths.
    Local { root: PathBuf },
}

impl fmt::Debug for ObjectStoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreSettings::Http { base_url, token } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
            ObjectStoreSettings::Local { root } => {
                f.debug_struct("Local").field("root", root).finish()
            }
        }
    }
}

/// Engine settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vendor_base_url: String,
    pub vendor_api_key: Option<String>,
    /// Provider name written into query-tool knowledge bases.
    pub query_tool_provider: String,
    /// Maximum PATCH attempts for the attach step.
    pub patch_max_retries: u32,
    /// Base delay of the PATCH backoff; attempt `n` waits `base × 2^n`.
    pub patch_backoff_base_ms: u64,
    /// Delivery attempts per job in the daemon queue.
    pub job_max_attempts: u32,
    pub job_backoff_base_ms: u64,
    /// HTTP timeout for every backend call.
    pub http_timeout_secs: u64,
    pub object_store: Option<ObjectStoreSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vendor_base_url: "https://api.vapi.ai".to_string(),
            vendor_api_key: None,
            query_tool_provider: "google".to_string(),
            patch_max_retries: 3,
            patch_backoff_base_ms: 1_000,
            job_max_attempts: 3,
            job_backoff_base_ms: 2_000,
            http_timeout_secs: 30,
            object_store: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("vendor_base_url", &self.vendor_base_url)
            .field(
                "vendor_api_key",
                &self.vendor_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("query_tool_provider", &self.query_tool_provider)
            .field("patch_max_retries", &self.patch_max_retries)
            .field("patch_backoff_base_ms", &self.patch_backoff_base_ms)
            .field("job_max_attempts", &self.job_max_attempts)
            .field("job_backoff_base_ms", &self.job_backoff_base_ms)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("object_store", &self.object_store)
            .finish()
    }
}

impl Settings {
    pub fn patch_backoff_base(&self) -> Duration {
        Duration::from_millis(self.patch_backoff_base_ms)
    }

    pub fn job_backoff_base(&self) -> Duration {
        Duration::from_millis(self.job_backoff_base_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Configured object store, or `~/.kbsync/archive` when unset.
    pub fn object_store_or_default(&self, home: &Path) -> ObjectStoreSettings {
        self.object_store
            .clone()
            .unwrap_or_else(|| ObjectStoreSettings::Local {
                root: root_at(home).join("archive"),
            })
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(ENV_VENDOR_API_KEY) {
            self.vendor_api_key = Some(key);
        }
        if let Some(url) = non_empty(ENV_VENDOR_BASE_URL) {
            self.vendor_base_url = url;
        }
        if let Some(base_url) = non_empty(ENV_OBJECT_STORE_URL) {
            let token = non_empty(ENV_OBJECT_STORE_TOKEN);
            self.object_store = Some(ObjectStoreSettings::Http { base_url, token });
        } else if let Some(root) = non_empty(ENV_OBJECT_STORE_ROOT) {
            self.object_store = Some(ObjectStoreSettings::Local {
                root: PathBuf::from(root),
            });
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.vendor_base_url.trim().is_empty() {
            return Err(StoreError::InvalidSettings(
                "vendor_base_url must not be empty".to_string(),
            ));
        }
        if self.patch_max_retries == 0 {
            return Err(StoreError::InvalidSettings(
                "patch_max_retries must be at least 1".to_string(),
            ));
        }
        if self.job_max_attempts < 3 {
            return Err(StoreError::InvalidSettings(
                "job_max_attempts must be at least 3".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<home>/.kbsync/config.yaml`
pub fn settings_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

/// Load settings from `config.yaml` (defaults if missing) plus the process
/// environment.
pub fn load_at(home: &Path) -> Result<Settings, StoreError> {
    let mut settings = read_file_at(home)?;
    settings.apply_env(|key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Settings, StoreError> {
    load_at(&crate::store::home()?)
}

fn read_file_at(home: &Path) -> Result<Settings, StoreError> {
    let path = settings_path_at(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
        path,
        message: e.to_string(),
    })
}
