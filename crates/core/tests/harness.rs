use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use probe_core::config::{DetectorSpec, ParserSpec, ProbeConfig};
use probe_core::services::default_kind_registry;
use probe_core::services::harness::{
    bisection_allowed, find_binaries, parse_whitelist, render_template, write_records,
    ArtifactProvider, BinaryArtifact, ConfigSet, DetectionHarness, HarnessOptions,
    HarnessSettings, PackageInfo, PackageRecord,
};
use probe_core::workspace::ScratchLayout;
use tempfile::tempdir;

fn package(name: &str, rank: u64) -> PackageInfo {
    PackageInfo {
        package_name: name.to_string(),
        rank,
        source: "debian".to_string(),
        version_number: "1.0-1".to_string(),
        maintainer: Some("Jo Maintainer".to_string()),
        git_repo_url: None,
        download_source_cmd: None,
        download_binary_cmd: None,
    }
}

/// Writes canned artifacts; packages named `broken*` fail to download.
#[derive(Default)]
struct FakeProvider {
    with_build_log: bool,
    seen_scratch: RefCell<Vec<PathBuf>>,
}

impl ArtifactProvider for FakeProvider {
    fn source_package(&self, info: &PackageInfo, layout: &ScratchLayout) -> Result<PathBuf> {
        if info.package_name.starts_with("broken") {
            bail!("package source could not be extracted");
        }
        assert!(fs::read_dir(&layout.source_dir)?.next().is_none(), "scratch dir not reset");
        self.seen_scratch.borrow_mut().push(layout.source_dir.clone());
        let dir = layout.source_dir.join(format!("{}-1.0", info.package_name));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("main.cpp"), "auto p = std::unique_ptr<int>(new int);\n")?;
        Ok(dir)
    }

    fn binary_package(
        &self,
        _info: &PackageInfo,
        _layout: &ScratchLayout,
    ) -> Result<Option<BinaryArtifact>> {
        Ok(None)
    }

    fn build_log(&self, _info: &PackageInfo, layout: &ScratchLayout) -> Result<Option<PathBuf>> {
        if !self.with_build_log {
            bail!("getbuildlog found nothing");
        }
        let log = layout.build_log_dir.join("build.log");
        fs::write(&log, "g++ -fPIE -o widget main.o\n")?;
        Ok(Some(log))
    }

    fn creation_date(&self, _info: &PackageInfo) -> Result<Option<NaiveDate>> {
        Ok(NaiveDate::from_ymd_opt(2015, 3, 14))
    }
}

fn config_with(feature: &str, detector: DetectorSpec) -> ProbeConfig {
    ProbeConfig {
        features_selected: vec![feature.to_string()],
        detectors: vec![detector],
        parsers: vec![ParserSpec::new("log", "build-log")],
        ..ProbeConfig::default()
    }
}

fn configs() -> ConfigSet<ProbeConfig> {
    let aslr = config_with(
        "aslr",
        DetectorSpec::new("aslr", "aslr").with_parser("log").with_features(["aslr"]),
    );
    let pointers = config_with(
        "unique_ptr",
        DetectorSpec::new("pointers", "smart-pointer").with_features(["unique_ptr"]),
    );
    ConfigSet {
        full: aslr.clone(),
        without_build_log: pointers.clone(),
        without_binary: aslr,
        source_only: pointers,
    }
}

#[test]
fn config_is_chosen_from_available_artifacts() {
    let set = ConfigSet { full: 1, without_build_log: 2, without_binary: 3, source_only: 4 };
    assert_eq!(*set.select(true, true), 1);
    assert_eq!(*set.select(true, false), 2);
    assert_eq!(*set.select(false, true), 3);
    assert_eq!(*set.select(false, false), 4);
}

#[test]
fn failing_package_is_skipped_and_batch_continues() {
    let temp = tempdir().unwrap();
    let layout = ScratchLayout::new(temp.path().join("scratch"));
    let configs = configs();
    let kinds = default_kind_registry();
    let harness = DetectionHarness::new(
        &configs,
        &configs.source_only,
        &kinds,
        layout.clone(),
        FakeProvider { with_build_log: true, ..FakeProvider::default() },
    );

    let packages = vec![package("alpha", 1), package("broken", 2), package("gamma", 3)];
    let records = harness.run(&packages).unwrap();

    let names: Vec<&str> = records.iter().map(|r| r.package_name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "gamma"]);
    let first = &records[0];
    assert_eq!(first.detection_tool_output, serde_json::json!({"aslr": true}));
    assert_eq!(first.creation_date.as_deref(), Some("2015-03-14"));
    assert_eq!(first.maintainer.as_deref(), Some("Jo Maintainer"));
    assert!(first.git_bisection_data.is_none());
    assert_eq!(first.data_collection_timestamp.len(), "2024-01-01-00:00:00".len());

    for dir in layout.package_dirs() {
        assert!(!dir.exists(), "{} left behind", dir.display());
    }
}

#[cfg(unix)]
#[test]
fn missing_build_log_selects_source_only_config() {
    let temp = tempdir().unwrap();
    let configs = configs();
    let kinds = default_kind_registry();
    let harness = DetectionHarness::new(
        &configs,
        &configs.source_only,
        &kinds,
        ScratchLayout::new(temp.path().join("scratch")),
        FakeProvider::default(),
    );
    let records = harness.run(&[package("alpha", 1)]).unwrap();
    assert_eq!(
        records[0].detection_tool_output,
        serde_json::json!({"unique_ptr": {"detected": "yes", "occurrences": 1}})
    );
}

#[test]
fn offset_and_count_limit_successful_records() {
    let temp = tempdir().unwrap();
    let configs = configs();
    let kinds = default_kind_registry();
    let provider = FakeProvider { with_build_log: true, ..FakeProvider::default() };
    let harness = DetectionHarness::new(
        &configs,
        &configs.source_only,
        &kinds,
        ScratchLayout::new(temp.path().join("scratch")),
        provider,
    )
    .with_options(HarnessOptions { start_offset: 1, count: Some(2), skip_bisect: true });

    let packages: Vec<PackageInfo> = ["a", "broken", "c", "d", "e"]
        .iter()
        .enumerate()
        .map(|(i, name)| package(name, i as u64))
        .collect();
    let records = harness.run(&packages).unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.package_name.as_str()).collect();
    assert_eq!(names, vec!["c", "d"]);
}

#[test]
fn github_urls_need_whitelisting() {
    let whitelist = parse_whitelist("https://github.com/acme/widget\n\n  \n");
    assert_eq!(whitelist.len(), 1);
    assert!(bisection_allowed("https://github.com/acme/widget", &whitelist));
    assert!(!bisection_allowed("https://github.com/acme/other", &whitelist));
    assert!(bisection_allowed("https://salsa.debian.org/acme/other.git", &HashSet::new()));
}

#[test]
fn templates_substitute_per_token() {
    let args = render_template(
        "getbuildlog {package} last amd64",
        &[("package", "widget"), ("version", "1.0")],
    );
    assert_eq!(args, vec!["getbuildlog", "widget", "last", "amd64"]);
}

#[test]
fn binaries_are_found_in_bin_directories() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    fs::create_dir_all(root.join("usr/bin")).unwrap();
    fs::create_dir_all(root.join("usr/share/doc")).unwrap();
    fs::write(root.join("usr/bin/widget"), b"bin").unwrap();
    fs::write(root.join("usr/share/doc/README"), b"doc").unwrap();
    assert_eq!(find_binaries(root).unwrap(), vec![PathBuf::from("usr/bin/widget")]);
}

#[test]
fn settings_paths_resolve_next_to_the_settings_file() {
    let temp = tempdir().unwrap();
    let settings_path = temp.path().join("harness.yaml");
    fs::write(
        &settings_path,
        r#"
configs:
  full: configs/full.yaml
  without_build_log: configs/no_log.yaml
  without_binary: configs/no_binary.yaml
  source_only: /etc/probe/source_only.yaml
github_whitelist: whitelist.txt
commands:
  build_log: null
"#,
    )
    .unwrap();
    let settings = HarnessSettings::load(&settings_path).unwrap();
    assert_eq!(settings.configs.full, temp.path().join("configs/full.yaml"));
    assert_eq!(settings.configs.source_only, PathBuf::from("/etc/probe/source_only.yaml"));
    assert_eq!(settings.github_whitelist, Some(temp.path().join("whitelist.txt")));
    assert_eq!(settings.scratch_root, temp.path().join("harness_scratch"));
    assert_eq!(settings.commands.build_log, None);
    assert_eq!(settings.commands.extract, "dpkg -x {deb} {dest}");
}

#[test]
fn records_serialize_with_optional_fields_omitted() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("results.json");
    let record = PackageRecord {
        package_name: "widget".into(),
        rank: 7,
        source: "debian".into(),
        version_number: "2.0".into(),
        data_collection_timestamp: "2020-01-02-03:04:05".into(),
        detection_tool_output: serde_json::json!({"aslr": false}),
        creation_date: None,
        git_bisection_data: None,
        maintainer: None,
    };
    write_records(&out, &[record]).unwrap();
    let body = fs::read_to_string(&out).unwrap();
    assert!(body.ends_with("]\n"));
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    let keys: Vec<&str> = parsed[0].as_object().unwrap().keys().map(String::as_str).collect();
    assert!(!keys.contains(&"creation_date"));
    assert!(!keys.contains(&"git_bisection_data"));
    assert_eq!(parsed[0]["rank"], 7);
}

#[cfg(unix)]
mod bisection {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::process::Command;

    use super::*;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
    }

    fn git(repo: &Path, args: &[&str], date: &str) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(["-c", "user.name=Probe Test", "-c", "user.email=probe@example.com"])
            .args(args)
            .env("GIT_AUTHOR_DATE", date)
            .env("GIT_COMMITTER_DATE", date)
            .output()
            .expect("run git");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(output.status.success(), "git {args:?}: {stderr}");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Four dated commits: `unique_ptr` arrives in the third, `shared_ptr` in the fourth.
    fn pointer_repo(repo: &Path) -> Vec<String> {
        fs::create_dir_all(repo).unwrap();
        git(repo, &["init", "-q"], "2014-01-01T12:00:00 +0000");
        git(repo, &["symbolic-ref", "HEAD", "refs/heads/main"], "2014-01-01T12:00:00 +0000");
        let files = [
            ("main.cpp", "int main() { return 0; }\n", "2014-02-03T12:00:00 +0000"),
            ("util.h", "int helper();\n", "2015-06-07T12:00:00 +0000"),
            ("owner.cpp", "std::unique_ptr<int> owner;\n", "2016-08-09T12:00:00 +0000"),
            ("shared.cpp", "std::shared_ptr<int> shared;\n", "2017-10-11T12:00:00 +0000"),
        ];
        files
            .iter()
            .map(|(name, body, date)| {
                fs::write(repo.join(name), body).unwrap();
                git(repo, &["add", name], date);
                git(repo, &["commit", "-q", "-m", &format!("add {name}")], date);
                git(repo, &["rev-parse", "HEAD"], date)
            })
            .collect()
    }

    fn pointer_bisection_config() -> ProbeConfig {
        ProbeConfig {
            features_selected: vec!["unique_ptr".into(), "shared_ptr".into(), "weak_ptr".into()],
            detectors: vec![DetectorSpec::new("pointers", "smart-pointer")
                .with_features(["unique_ptr", "shared_ptr", "weak_ptr"])],
            ..ProbeConfig::default()
        }
    }

    fn repo_package(repo: &Path) -> PackageInfo {
        let url = repo.to_string_lossy().to_string();
        PackageInfo { git_repo_url: Some(url), ..package("alpha", 1) }
    }

    #[test]
    fn repository_features_are_attributed_to_their_commits() {
        if !git_available() {
            return;
        }
        let temp = tempdir().unwrap();
        let repo = temp.path().join("upstream");
        let commits = pointer_repo(&repo);
        let layout = ScratchLayout::new(temp.path().join("scratch"));
        let configs = configs();
        let bisection = pointer_bisection_config();
        let kinds = default_kind_registry();
        let harness = DetectionHarness::new(
            &configs,
            &bisection,
            &kinds,
            layout.clone(),
            FakeProvider::default(),
        );

        let records = harness.run(&[repo_package(&repo)]).unwrap();
        let data = records[0].git_bisection_data.as_ref().expect("bisection data");
        assert_eq!(data.git_repo_url, repo.to_string_lossy());
        assert_eq!(data.creation_timestamp, "2014-02-03");
        assert_eq!(data.features.len(), 2, "weak_ptr never appears");
        assert_eq!(data.features["unique_ptr"].commit, commits[2]);
        assert_eq!(data.features["unique_ptr"].timestamp, "2016-08-09");
        assert_eq!(data.features["shared_ptr"].commit, commits[3]);
        assert!(!layout.git_dir.exists());
        assert_eq!(git(&repo, &["rev-parse", "HEAD"], "2014-01-01T12:00:00 +0000"), commits[3]);
    }

    #[test]
    fn failed_date_lookup_only_drops_that_feature() {
        if !git_available() {
            return;
        }
        let temp = tempdir().unwrap();
        let repo = temp.path().join("upstream");
        let commits = pointer_repo(&repo);
        // Delegates to git, but cannot date the commit introducing unique_ptr.
        let wrapper = temp.path().join("git-wrapper");
        let script = format!(
            concat!(
                "#!/bin/sh\n",
                "case \"$*\" in\n",
                "  *--date=short*{}*) echo 'bad object' >&2; exit 128 ;;\n",
                "esac\n",
                "exec git \"$@\"\n",
            ),
            commits[2]
        );
        fs::write(&wrapper, script).unwrap();
        fs::set_permissions(&wrapper, fs::Permissions::from_mode(0o755)).unwrap();

        let configs = configs();
        let bisection = pointer_bisection_config();
        let kinds = default_kind_registry();
        let harness = DetectionHarness::new(
            &configs,
            &bisection,
            &kinds,
            ScratchLayout::new(temp.path().join("scratch")),
            FakeProvider::default(),
        )
        .with_git(&wrapper);

        let records = harness.run(&[repo_package(&repo)]).unwrap();
        let data = records[0].git_bisection_data.as_ref().expect("bisection data");
        assert!(!data.features.contains_key("unique_ptr"));
        assert_eq!(data.features["shared_ptr"].commit, commits[3]);
        assert_eq!(data.features["shared_ptr"].timestamp, "2017-10-11");
    }

    #[test]
    fn skip_bisect_leaves_bisection_data_out() {
        if !git_available() {
            return;
        }
        let temp = tempdir().unwrap();
        let repo = temp.path().join("upstream");
        pointer_repo(&repo);
        let configs = configs();
        let bisection = pointer_bisection_config();
        let kinds = default_kind_registry();
        let harness = DetectionHarness::new(
            &configs,
            &bisection,
            &kinds,
            ScratchLayout::new(temp.path().join("scratch")),
            FakeProvider::default(),
        )
        .with_options(HarnessOptions { skip_bisect: true, ..HarnessOptions::default() });

        let records = harness.run(&[repo_package(&repo)]).unwrap();
        assert!(records[0].git_bisection_data.is_none());
    }
}
