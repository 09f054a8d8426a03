//! File-backed configuration and file-record store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.kbsync/
//!   configs/
//!     <config_id>.yaml    (one configuration record: mode 0600)
//!   files/
//!     <config_id>.json    (every file record of that configuration: mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.
//!
//! [`FsStore`] wraps the `_at` functions behind the [`ConfigStore`] and
//! [`FileRecordStore`] traits consumed by the sync engine.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

use crate::error::{io_err, StoreError};
use crate::types::{Business, ConfigId, ConfigurationRecord, FileRecord, SyncState};

// ---------------------------------------------------------------------------
// 1. Collaborator traits
// ---------------------------------------------------------------------------

/// Read access to configuration records plus the sync-owned fields.
pub trait ConfigStore: Send + Sync {
    /// Load a record with its business eagerly populated.
    fn load(&self, id: &ConfigId) -> Result<ConfigurationRecord, StoreError>;

    /// Overwrite only the sync-owned fields of a record.
    fn save_sync_state(&self, id: &ConfigId, state: &SyncState) -> Result<(), StoreError>;
}

/// Persistence for knowledge base file records.
pub trait FileRecordStore: Send + Sync {
    fn find_by_config(&self, id: &ConfigId) -> Result<Vec<FileRecord>, StoreError>;

    fn create(&self, id: &ConfigId, records: &[FileRecord]) -> Result<(), StoreError>;

    /// Replace records matching by [`FileRecord::record_id`].
    fn update(&self, id: &ConfigId, records: &[FileRecord]) -> Result<(), StoreError>;

    /// Delete the records with the given record ids; unknown ids are ignored.
    fn delete(&self, id: &ConfigId, record_ids: &[String]) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.kbsync`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".kbsync")
}

/// `<home>/.kbsync/configs`
pub fn configs_dir_at(home: &Path) -> PathBuf {
    root_at(home).join("configs")
}

/// `<home>/.kbsync/configs/<id>.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path, id: &ConfigId) -> PathBuf {
    configs_dir_at(home).join(format!("{}.yaml", id.0))
}

/// `<home>/.kbsync/files/<id>.json`: pure, no I/O.
pub fn files_path_at(home: &Path, id: &ConfigId) -> PathBuf {
    root_at(home).join("files").join(format!("{}.json", id.0))
}

/// Reject ids that would resolve outside `configs/` or `files/`.
pub fn validate_config_id(id: &ConfigId) -> Result<(), StoreError> {
    let raw = id.0.as_str();
    let ok = !raw.is_empty()
        && raw != "."
        && raw != ".."
        && !raw.contains(|c: char| c == '/' || c == '\\' || c == '\0');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidConfigId(raw.to_string()))
    }
}

// ---------------------------------------------------------------------------
// 3. Configuration records
// ---------------------------------------------------------------------------

/// Load one configuration record.
///
/// Returns `StoreError::ConfigNotFound` if absent,
/// `StoreError::Parse` (with path) if malformed YAML.
pub fn load_config_at(home: &Path, id: &ConfigId) -> Result<ConfigurationRecord, StoreError> {
    validate_config_id(id)?;
    let path = config_path_at(home, id);
    if !path.exists() {
        return Err(StoreError::ConfigNotFound {
            id: id.0.clone(),
            path,
        });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
        path,
        message: e.to_string(),
    })
}

/// `load_config_at` convenience wrapper.
pub fn load_config(id: &ConfigId) -> Result<ConfigurationRecord, StoreError> {
    load_config_at(&home()?, id)
}

/// List every configuration record, sorted by id.
pub fn list_configs_at(home: &Path) -> Result<Vec<ConfigurationRecord>, StoreError> {
    let dir = configs_dir_at(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".yaml"))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let record = serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// `list_configs_at` convenience wrapper.
pub fn list_configs() -> Result<Vec<ConfigurationRecord>, StoreError> {
    list_configs_at(&home()?)
}

/// Atomically save a configuration record.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_config_at(home: &Path, record: &ConfigurationRecord) -> Result<(), StoreError> {
    validate_config_id(&record.id)?;
    let path = config_path_at(home, &record.id);
    let yaml = serde_yaml::to_string(record)?;
    write_atomic(&path, yaml.as_bytes())
}

/// Create or update the payload of a configuration.
///
/// This is the configuration-update path: every call bumps `version`, so
/// file records can tell which payload they were generated from. Sync-owned
/// fields of an existing record are preserved.
pub fn put_payload_at(
    home: &Path,
    id: &ConfigId,
    business: Business,
    industry: Option<String>,
    payload: Value,
) -> Result<ConfigurationRecord, StoreError> {
    let now = Utc::now();
    let record = match load_config_at(home, id) {
        Ok(mut existing) => {
            existing.business = business;
            existing.industry = industry;
            existing.payload = payload;
            existing.version += 1;
            existing.updated_at = now;
            existing
        }
        Err(StoreError::ConfigNotFound { .. }) => ConfigurationRecord {
            id: id.clone(),
            business,
            industry,
            version: 1,
            payload,
            sync: SyncState::default(),
            created_at: now,
            updated_at: now,
        },
        Err(err) => return Err(err),
    };
    save_config_at(home, &record)?;
    Ok(record)
}

/// `put_payload_at` convenience wrapper.
pub fn put_payload(
    id: &ConfigId,
    business: Business,
    industry: Option<String>,
    payload: Value,
) -> Result<ConfigurationRecord, StoreError> {
    put_payload_at(&home()?, id, business, industry, payload)
}

/// Overwrite the sync-owned fields, leaving payload and version untouched.
pub fn save_sync_state_at(home: &Path, id: &ConfigId, state: &SyncState) -> Result<(), StoreError> {
    let mut record = load_config_at(home, id)?;
    record.sync = state.clone();
    save_config_at(home, &record)
}

// ---------------------------------------------------------------------------
// 4. File records
// ---------------------------------------------------------------------------

/// Load all file records of a configuration; empty if none were written yet.
pub fn load_file_records_at(home: &Path, id: &ConfigId) -> Result<Vec<FileRecord>, StoreError> {
    validate_config_id(id)?;
    let path = files_path_at(home, id);
    if !path.exists() {
        return Ok(vec![]);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&contents).map_err(|e| StoreError::Parse {
        path,
        message: e.to_string(),
    })
}

/// Atomically replace all file records of a configuration.
pub fn save_file_records_at(
    home: &Path,
    id: &ConfigId,
    records: &[FileRecord],
) -> Result<(), StoreError> {
    validate_config_id(id)?;
    let path = files_path_at(home, id);
    let json = serde_json::to_string_pretty(records)?;
    write_atomic(&path, json.as_bytes())
}

// ---------------------------------------------------------------------------
// 5. FsStore
// ---------------------------------------------------------------------------

/// [`ConfigStore`] + [`FileRecordStore`] over the `~/.kbsync` layout.
#[derive(Debug, Clone)]
pub struct FsStore {
    home: PathBuf,
}

impl FsStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Store rooted at the user's home directory.
    pub fn from_home() -> Result<Self, StoreError> {
        Ok(Self::new(home()?))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

impl ConfigStore for FsStore {
    fn load(&self, id: &ConfigId) -> Result<ConfigurationRecord, StoreError> {
        load_config_at(&self.home, id)
    }

    fn save_sync_state(&self, id: &ConfigId, state: &SyncState) -> Result<(), StoreError> {
        save_sync_state_at(&self.home, id, state)
    }
}

impl FileRecordStore for FsStore {
    fn find_by_config(&self, id: &ConfigId) -> Result<Vec<FileRecord>, StoreError> {
        load_file_records_at(&self.home, id)
    }

    fn create(&self, id: &ConfigId, records: &[FileRecord]) -> Result<(), StoreError> {
        let mut all = load_file_records_at(&self.home, id)?;
        all.extend(records.iter().cloned());
        save_file_records_at(&self.home, id, &all)
    }

    fn update(&self, id: &ConfigId, records: &[FileRecord]) -> Result<(), StoreError> {
        let mut all = load_file_records_at(&self.home, id)?;
        for updated in records {
            let key = updated.record_id();
            if let Some(slot) = all.iter_mut().find(|r| r.record_id() == key) {
                *slot = updated.clone();
            }
        }
        save_file_records_at(&self.home, id, &all)
    }

    fn delete(&self, id: &ConfigId, record_ids: &[String]) -> Result<(), StoreError> {
        let mut all = load_file_records_at(&self.home, id)?;
        all.retain(|r| !record_ids.contains(&r.record_id()));
        save_file_records_at(&self.home, id, &all)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

pub(crate) fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

/// `<path>.tmp` sibling → `chmod 0600` → `rename`. Creates the parent (0700).
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("path has no parent")));
    };
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
