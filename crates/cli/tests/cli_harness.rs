#![cfg(unix)]

use std::fs;

use predicates::prelude::*;
use tempfile::tempdir;

const SOURCE_CONFIG: &str = r#"
features_selected: [unique_ptr]
detectors:
  - name: pointers
    kind: smart-pointer
    features: [unique_ptr]
"#;

const SETTINGS: &str = r#"
configs:
  full: source.yaml
  without_build_log: source.yaml
  without_binary: source.yaml
  source_only: source.yaml
scratch_root: scratch
commands:
  build_log: null
  creation_time: echo 1420113600
"#;

const PACKAGES: &str = r#"[
  {"package_name": "widget", "rank": 1, "source": "debian", "version_number": "1.0-1",
   "maintainer": "Jo Maintainer", "download_source_cmd": "mkdir widget-1.0"},
  {"package_name": "gadget", "rank": 2, "source": "debian", "version_number": "2.0-1"}
]"#;

#[test]
fn harness_writes_records_for_packages_that_succeed() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    fs::write(root.join("source.yaml"), SOURCE_CONFIG).expect("write config");
    fs::write(root.join("settings.yaml"), SETTINGS).expect("write settings");
    fs::write(root.join("packages.json"), PACKAGES).expect("write packages");
    let out = root.join("results.json");

    assert_cmd::cargo::cargo_bin_cmd!("feature-probe")
        .arg("harness")
        .arg(root.join("packages.json"))
        .arg("--settings")
        .arg(root.join("settings.yaml"))
        .arg("--out")
        .arg(&out)
        .arg("--no-bisect")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let records: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out).expect("read results")).expect("json");
    let records = records.as_array().expect("array");
    assert_eq!(records.len(), 1, "gadget has no source command and is skipped");
    let widget = &records[0];
    assert_eq!(widget["package_name"], "widget");
    assert_eq!(widget["maintainer"], "Jo Maintainer");
    assert_eq!(widget["creation_date"], "2015-01-01");
    assert_eq!(widget["detection_tool_output"]["unique_ptr"]["occurrences"], 0);
    assert!(!root.join("scratch/source_package_downloads").exists());
}

#[test]
fn harness_requires_existing_settings() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("packages.json"), "[]").expect("write packages");

    assert_cmd::cargo::cargo_bin_cmd!("feature-probe")
        .arg("harness")
        .arg(dir.path().join("packages.json"))
        .arg("--settings")
        .arg(dir.path().join("missing.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("--settings: file does not exist"));
}
