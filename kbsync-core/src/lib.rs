//! kbsync core library: domain types, settings, file-backed stores, errors.
//!
//! - [`types`]: configuration records, file records, sync status
//! - [`settings`]: injected client configuration
//! - [`store`]: collaborator traits and the `~/.kbsync` file store
//! - [`error`]: [`StoreError`]

pub mod error;
pub mod settings;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use settings::{ObjectStoreSettings, Settings};
pub use store::{ConfigStore, FileRecordStore, FsStore};
pub use types::{
    sanitize_business_id, Business, BusinessId, ConfigId, ConfigurationRecord, DocumentSection,
    FileRecord, RemoteSchema, SyncState, SyncStatus, UploadState,
};
