#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use probe_core::config::{DetectorSpec, ProbeConfig};
use probe_core::services::bisect::{bisect_feature, BisectOutcome, NotFoundReason};
use probe_core::services::{default_kind_registry, ProbeError};
use probe_core::services::git::GitWorkTree;
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(60);

fn git_available() -> bool {
    Command::new("git").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
}

fn git(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["-c", "user.name=Probe Test", "-c", "user.email=probe@example.com"])
        .args(args)
        .output()
        .expect("run git");
    assert!(output.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn commit_file(repo: &Path, name: &str, body: &str) -> String {
    fs::write(repo.join(name), body).unwrap();
    git(repo, &["add", name]);
    git(repo, &["commit", "-q", "-m", &format!("add {name}")]);
    git(repo, &["rev-parse", "HEAD"])
}

/// Four commits; the third introduces a dynamic_cast.
fn fixture_repo(repo: &Path) -> Vec<String> {
    fs::create_dir_all(repo).unwrap();
    git(repo, &["init", "-q"]);
    git(repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    vec![
        commit_file(repo, "main.cpp", "int main() { return 0; }\n"),
        commit_file(repo, "util.h", "int helper();\n"),
        commit_file(repo, "shape.cpp", "auto* c = dynamic_cast<Circle*>(shape);\n"),
        commit_file(repo, "README", "docs\n"),
    ]
}

fn cast_config() -> ProbeConfig {
    ProbeConfig {
        detectors: vec![DetectorSpec::new("casts", "named-cast").with_features(["dynamic_cast"])],
        ..ProbeConfig::default()
    }
}

#[test]
fn bisection_finds_the_introducing_commit_and_restores_the_branch() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    let tree = GitWorkTree::open(&repo, TIMEOUT).unwrap();
    let config = cast_config();
    let kinds = default_kind_registry();

    let outcome =
        bisect_feature(&tree, &config, &kinds, "dynamic_cast", &commits[0], &commits[2]).unwrap();
    assert_eq!(outcome.commit(), Some(commits[2].as_str()));

    assert_eq!(tree.current_ref().unwrap(), "main");
    assert_eq!(tree.head_commit().unwrap(), commits[3]);
    assert!(repo.join("README").exists());
}

#[test]
fn bisection_is_not_found_when_oldest_commit_has_feature() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    let tree = GitWorkTree::open(&repo, TIMEOUT).unwrap();
    let kinds = default_kind_registry();

    let outcome =
        bisect_feature(&tree, &cast_config(), &kinds, "dynamic_cast", &commits[2], &commits[3])
            .unwrap();
    assert!(matches!(
        outcome,
        BisectOutcome::NotFound { reason: NotFoundReason::PresentAtOldest, .. }
    ));
}

#[test]
fn bisection_rejects_unknown_feature_before_touching_the_tree() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    let tree = GitWorkTree::open(&repo, TIMEOUT).unwrap();
    let kinds = default_kind_registry();

    let err = bisect_feature(&tree, &cast_config(), &kinds, "aslr", &commits[0], &commits[3])
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(tree.head_commit().unwrap(), commits[3]);
}

#[test]
fn history_helpers_follow_first_parent_line() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    let tree = GitWorkTree::open(&repo, TIMEOUT).unwrap();

    assert_eq!(tree.first_parent_range(&commits[0], "HEAD").unwrap(), commits);
    assert_eq!(tree.root_commit("HEAD").unwrap(), commits[0]);
    let date = tree.commit_date(&commits[0]).unwrap();
    assert_eq!(date.format("%Y-%m-%d").to_string().len(), 10);
}

#[test]
fn cloned_tree_is_removed_on_drop() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    let dest = temp.path().join("clone");

    {
        let url = repo.to_string_lossy().to_string();
        let tree = GitWorkTree::clone_from(&url, &dest, TIMEOUT).unwrap();
        assert_eq!(tree.head_commit().unwrap(), commits[3]);
        assert!(dest.join("shape.cpp").exists());
    }
    assert!(!dest.exists());

    let opened = GitWorkTree::open(&repo, TIMEOUT).unwrap();
    drop(opened);
    assert!(repo.exists());
}

#[test]
fn bisecting_an_opened_tree_keeps_local_work() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    fs::write(repo.join("notes.txt"), "scratch notes\n").unwrap();
    fs::write(repo.join("main.cpp"), "int main() { return 42; }\n").unwrap();
    let tree = GitWorkTree::open(&repo, TIMEOUT).unwrap();
    let kinds = default_kind_registry();

    let outcome =
        bisect_feature(&tree, &cast_config(), &kinds, "dynamic_cast", &commits[0], &commits[3])
            .unwrap();
    assert_eq!(outcome.commit(), Some(commits[2].as_str()));

    assert_eq!(fs::read_to_string(repo.join("notes.txt")).unwrap(), "scratch notes\n");
    assert_eq!(fs::read_to_string(repo.join("main.cpp")).unwrap(), "int main() { return 42; }\n");
    assert_eq!(tree.current_ref().unwrap(), "main");
    assert_eq!(tree.head_commit().unwrap(), commits[3]);
    let worktrees = git(&repo, &["worktree", "list", "--porcelain"]);
    assert_eq!(worktrees.lines().filter(|l| l.starts_with("worktree ")).count(), 1);
}

#[test]
fn bisecting_a_clone_checks_out_in_place_and_restores_it() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    let url = repo.to_string_lossy().to_string();
    let tree = GitWorkTree::clone_from(&url, &temp.path().join("clone"), TIMEOUT).unwrap();
    assert!(tree.is_owned());
    let kinds = default_kind_registry();

    let outcome =
        bisect_feature(&tree, &cast_config(), &kinds, "dynamic_cast", &commits[0], &commits[3])
            .unwrap();
    assert_eq!(outcome.commit(), Some(commits[2].as_str()));
    assert_eq!(tree.current_ref().unwrap(), "main");
    assert_eq!(tree.head_commit().unwrap(), commits[3]);
}

#[test]
fn reversed_range_is_rejected() {
    if !git_available() {
        return;
    }
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    let commits = fixture_repo(&repo);
    let tree = GitWorkTree::open(&repo, TIMEOUT).unwrap();

    assert!(tree.is_ancestor(&commits[0], &commits[3]).unwrap());
    assert!(tree.is_ancestor(&commits[1], &commits[1]).unwrap());
    assert!(!tree.is_ancestor(&commits[3], &commits[0]).unwrap());

    let err = tree.first_parent_range(&commits[3], &commits[0]).unwrap_err();
    assert!(matches!(err, ProbeError::InvalidConfig(_)), "{err:?}");
    assert!(err.to_string().contains("not an ancestor"));

    let kinds = default_kind_registry();
    let err =
        bisect_feature(&tree, &cast_config(), &kinds, "dynamic_cast", &commits[3], &commits[0])
            .unwrap_err();
    assert!(matches!(err, ProbeError::InvalidConfig(_)), "{err:?}");
}
