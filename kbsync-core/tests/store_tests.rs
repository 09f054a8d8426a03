//! Store error-message, atomic-write-safety, and update-path integration tests.
//! Layout: ~/.kbsync/configs/<id>.yaml + ~/.kbsync/files/<id>.json

use assert_fs::prelude::*;
use kbsync_core::{
    store::{self, ConfigStore, FileRecordStore, FsStore},
    types::{Business, BusinessId, ConfigId, SyncState, SyncStatus},
    StoreError,
};
use predicates::prelude::predicate;
use serde_json::json;
use std::fs;

fn cfg() -> ConfigId {
    ConfigId::from("cfg-acme")
}

fn business() -> Business {
    Business {
        id: BusinessId::from("acme"),
        name: "Acme Spa".to_string(),
        assistant_id: None,
    }
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_names_id_and_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = store::load_config_at(home.path(), &cfg()).unwrap_err();
    assert!(matches!(err, StoreError::ConfigNotFound { .. }), "got: {err}");
    let msg = err.to_string();
    assert!(msg.contains("cfg-acme"), "must name the id, got: {msg}");
    assert!(msg.contains("cfg-acme.yaml"), "must name the path, got: {msg}");
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".kbsync/configs/cfg-acme.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = store::load_config_at(home.path(), &cfg()).unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("cfg-acme.yaml"));
}

#[test]
fn corrupt_file_records_surface_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".kbsync/files/cfg-acme.json")
        .write_str("{not json")
        .expect("write");
    let err = FsStore::new(home.path()).find_by_config(&cfg()).unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn put_payload_writes_config_file_without_tmp() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    store::put_payload_at(home.path(), &cfg(), business(), None, json!({"faq": ["hi"]}))
        .expect("put");

    home.child(".kbsync/configs/cfg-acme.yaml")
        .assert(predicate::path::exists());
    home.child(".kbsync/configs/cfg-acme.yaml.tmp")
        .assert(predicate::path::missing());
}

#[cfg(unix)]
#[test]
fn config_file_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    store::put_payload_at(home.path(), &cfg(), business(), None, json!({})).expect("put");
    let path = store::config_path_at(home.path(), &cfg());
    let mode = fs::metadata(path).expect("meta").permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

// ---------------------------------------------------------------------------
// 3. Update path and sync-owned fields
// ---------------------------------------------------------------------------

#[test]
fn version_increments_on_every_payload_update() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    for expected in 1..=3u64 {
        let record = store::put_payload_at(
            home.path(),
            &cfg(),
            business(),
            None,
            json!({ "faq": [expected] }),
        )
        .expect("put");
        assert_eq!(record.version, expected);
    }
}

#[test]
fn sync_state_roundtrips_through_fs_store() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    store::put_payload_at(home.path(), &cfg(), business(), None, json!({})).expect("put");
    let fs_store = FsStore::new(home.path());

    let state = SyncState {
        status: SyncStatus::NeedsManualReview,
        last_error: Some(r#"{"id":"asst-1"}"#.to_string()),
        ..SyncState::default()
    };
    fs_store.save_sync_state(&cfg(), &state).expect("save");
    assert_eq!(fs_store.load(&cfg()).expect("load").sync, state);
}

#[test]
fn list_configs_is_sorted_by_id() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    for id in ["zeta", "alpha", "mid"] {
        store::put_payload_at(home.path(), &ConfigId::from(id), business(), None, json!({}))
            .expect("put");
    }
    let ids: Vec<String> = store::list_configs_at(home.path())
        .expect("list")
        .into_iter()
        .map(|r| r.id.0)
        .collect();
    assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
}
