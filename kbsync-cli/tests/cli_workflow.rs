use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::{json, Value};
use tempfile::TempDir;

fn kbsync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("kbsync"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    for key in [
        "KBSYNC_VENDOR_API_KEY",
        "KBSYNC_VENDOR_BASE_URL",
        "KBSYNC_OBJECT_STORE_URL",
        "KBSYNC_OBJECT_STORE_TOKEN",
        "KBSYNC_OBJECT_STORE_ROOT",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn put_config(home: &TempDir, payload: Value) {
    let file = home.path().join("payload.json");
    fs::write(&file, payload.to_string()).expect("write payload");
    kbsync_cmd(home.path())
        .args([
            "config",
            "put",
            "cfg-acme",
            "--business-id",
            "acme",
            "--business-name",
            "Acme Spa",
            "--industry",
            "wellness",
            "--payload",
        ])
        .arg(&file)
        .assert()
        .success();
}

fn sample_payload() -> Value {
    json!({
        "establishment": {"address": "1 Main St", "parking": true},
        "faq": [{"question": "Do you take walk-ins?", "answer": "Weekdays only"}]
    })
}

fn status_rows(home: &TempDir) -> Vec<Value> {
    let assert = kbsync_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("stdout utf8");
    serde_json::from_str(&stdout).expect("status json")
}

#[test]
fn config_put_bumps_the_version() {
    let home = TempDir::new().expect("home");
    put_config(&home, sample_payload());

    let file = home.path().join("payload.json");
    kbsync_cmd(home.path())
        .args([
            "config",
            "put",
            "cfg-acme",
            "--business-id",
            "acme",
            "--business-name",
            "Acme Spa",
            "--payload",
        ])
        .arg(&file)
        .assert()
        .success()
        .stdout(contains("version 2"));

    kbsync_cmd(home.path())
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(contains("cfg-acme"))
        .stdout(contains("no assistant"));
}

#[test]
fn config_put_rejects_non_object_payload() {
    let home = TempDir::new().expect("home");
    let file = home.path().join("payload.json");
    fs::write(&file, "[1, 2]").expect("write payload");
    kbsync_cmd(home.path())
        .args([
            "config",
            "put",
            "cfg-acme",
            "--business-id",
            "acme",
            "--business-name",
            "Acme Spa",
            "--payload",
        ])
        .arg(&file)
        .assert()
        .failure()
        .stderr(contains("JSON object"));
}

#[test]
fn render_writes_one_file_per_populated_section() {
    let home = TempDir::new().expect("home");
    put_config(&home, sample_payload());
    let out = home.path().join("preview");

    kbsync_cmd(home.path())
        .args(["render", "cfg-acme", "--out"])
        .arg(&out)
        .assert()
        .success()
        .stdout(contains("2 document(s) written"));

    let mut names: Vec<String> = fs::read_dir(&out)
        .expect("read preview")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["acme_establishment.md", "acme_faq.md"]);
    let faq = fs::read_to_string(out.join("acme_faq.md")).expect("faq");
    assert!(faq.contains("Do you take walk-ins?"));
}

#[test]
fn render_of_empty_payload_publishes_nothing() {
    let home = TempDir::new().expect("home");
    put_config(&home, json!({"supplementary": {}, "photos": []}));

    kbsync_cmd(home.path())
        .args(["render", "cfg-acme"])
        .assert()
        .success()
        .stdout(contains("nothing would be published"));
}

#[test]
fn sync_without_assistant_archives_documents_and_diff_is_clean() {
    let home = TempDir::new().expect("home");
    put_config(&home, sample_payload());

    // No vendor API key: the vendor half fails, the local archive succeeds.
    kbsync_cmd(home.path())
        .args(["sync", "cfg-acme"])
        .assert()
        .success()
        .stdout(contains("2 degraded"))
        .stdout(contains("no remote assistant"));

    let archived = home
        .path()
        .join(".kbsync/archive/archives/acme/acme_faq.md");
    assert!(archived.exists(), "archive copy written");

    let rows = status_rows(&home);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], json!("syncing"));
    assert_eq!(rows[0]["documents"], json!(2));
    assert_eq!(rows[0]["attachable"], json!(0));
    assert_eq!(rows[0]["missing_copies"], json!(2));

    kbsync_cmd(home.path())
        .args(["diff", "cfg-acme"])
        .assert()
        .success()
        .stdout(contains("No differences"));

    let mut changed = sample_payload();
    changed["faq"][0]["answer"] = json!("Every day");
    put_config(&home, changed);
    let assert = kbsync_cmd(home.path())
        .args(["diff", "cfg-acme"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("stdout utf8");
    assert!(stdout.contains("+++ b/acme_faq.md"));
    assert!(stdout
        .lines()
        .any(|line| line.starts_with('+') && line.contains("Every day")));
    assert!(stdout
        .lines()
        .any(|line| line.starts_with('-') && line.contains("Weekdays only")));
}

#[test]
fn retry_failed_reports_still_missing_vendor_copies() {
    let home = TempDir::new().expect("home");
    put_config(&home, sample_payload());
    kbsync_cmd(home.path())
        .args(["sync", "cfg-acme"])
        .assert()
        .success();

    kbsync_cmd(home.path())
        .args(["sync", "cfg-acme", "--retry-failed"])
        .assert()
        .success()
        .stdout(contains("2 retried, 0 recovered"));
}

#[test]
fn sync_of_unknown_configuration_fails() {
    let home = TempDir::new().expect("home");
    kbsync_cmd(home.path())
        .args(["sync", "missing"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn daemon_status_when_not_running() {
    let home = TempDir::new().expect("home");
    let assert = kbsync_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("stdout utf8");
    let payload: Value = serde_json::from_str(&stdout).expect("status json");
    assert_eq!(payload["running"], json!(false));
    assert!(payload["socket"]
        .as_str()
        .expect("socket")
        .ends_with(".kbsync/run/daemon.sock"));
}
