use std::path::PathBuf;

use anyhow::{Context, Result};
use probe_core::config::load_probe_config;
use probe_core::services::bisect::{bisect_feature, BisectOutcome};
use probe_core::services::default_kind_registry;
use probe_core::services::git::GitWorkTree;
use serde::Serialize;

use crate::{existing_dir, existing_file};

#[derive(Debug, Clone, Default)]
pub struct BisectArgs {
    pub config: PathBuf,
    pub repo: PathBuf,
    pub feature: String,
    /// Defaults to the first commit on the first-parent line of `new`.
    pub old: Option<String>,
    /// Defaults to `branch`, then `HEAD`.
    pub new: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BisectReport {
    pub feature: String,
    pub commit: Option<String>,
}

pub fn run_bisect(args: &BisectArgs) -> Result<BisectReport> {
    let config_path = existing_file("--config", &args.config)?;
    let repo = existing_dir("--repo", &args.repo)?;
    let config = load_probe_config(&config_path)?;
    let kinds = default_kind_registry();

    let tree = GitWorkTree::open(&repo, config.tool_timeout())
        .with_context(|| format!("{} is not a git working tree", repo.display()))?;
    let new = args.new.clone().or_else(|| args.branch.clone()).unwrap_or_else(|| "HEAD".into());
    let old = match &args.old {
        Some(old) => old.clone(),
        None => tree.root_commit(&new)?,
    };

    let outcome = bisect_feature(&tree, &config, &kinds, &args.feature, &old, &new)
        .with_context(|| format!("Bisection of '{}' failed", args.feature))?;
    let commit = match outcome {
        BisectOutcome::Introduced { commit, .. } => Some(commit),
        BisectOutcome::NotFound { .. } => None,
    };
    Ok(BisectReport { feature: args.feature.clone(), commit })
}

/// `bisect`: print `{"feature": ..., "commit": ...}`; `commit` is null when
/// no introducing commit lies in the range.
pub fn bisect_command(args: &BisectArgs) -> Result<()> {
    let report = run_bisect(args)?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
