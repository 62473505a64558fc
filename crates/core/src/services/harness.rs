//! Batch driver: acquire artifacts for each package, run detection, optionally
//! bisect, and collect one record per package.
//!
//! Every per-package failure is logged and the package skipped; the batch
//! always moves on to the next package.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{load_probe_config, ProbeConfig, DEFAULT_TOOL_TIMEOUT_SECS};
use crate::model::FeatureId;
use crate::services::bisect::{bisect_feature, BisectOutcome};
use crate::services::detection::DetectionInputs;
use crate::services::git::GitWorkTree;
use crate::services::registry::KindRegistry;
use crate::services::runner::Runner;
use crate::services::tool::{describe, resolve_tool, run_tool, run_tool_checked};
use crate::workspace::ScratchLayout;

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FMT: &str = "%Y-%m-%d-%H:%M:%S";
pub const DEFAULT_OUT_FILE: &str = "detection_results.json";

const BINARY_DIRS: [&str; 5] = ["usr/bin", "usr/sbin", "usr/games", "bin", "sbin"];

/// One entry of the package list produced by the package finder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_name: String,
    pub rank: u64,
    pub source: String,
    pub version_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_source_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_binary_cmd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureIntroduction {
    pub commit: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectionData {
    pub git_repo_url: String,
    /// Author date of the repository's first commit.
    pub creation_timestamp: String,
    pub features: BTreeMap<FeatureId, FeatureIntroduction>,
}

/// Output record for one successfully processed package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub package_name: String,
    pub rank: u64,
    pub source: String,
    pub version_number: String,
    pub data_collection_timestamp: String,
    pub detection_tool_output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_bisection_data: Option<BisectionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
}

/// Probe configs for each combination of available artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSet<T> {
    pub full: T,
    pub without_build_log: T,
    pub without_binary: T,
    pub source_only: T,
}

impl<T> ConfigSet<T> {
    /// Pick the config matching the artifacts that were actually acquired.
    pub fn select(&self, has_binary: bool, has_build_log: bool) -> &T {
        match (has_binary, has_build_log) {
            (true, true) => &self.full,
            (true, false) => &self.without_build_log,
            (false, true) => &self.without_binary,
            (false, false) => &self.source_only,
        }
    }
}

/// Shell-style command templates used by [`CommandArtifactProvider`].
///
/// Templates are split on whitespace before placeholders (`{package}`,
/// `{version}`, `{deb}`, `{dest}`) are substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSettings {
    #[serde(default = "default_extract_cmd")]
    pub extract: String,
    #[serde(default = "default_build_log_cmd")]
    pub build_log: Option<String>,
    /// Prints binary paths relative to the extraction root, one per line.
    /// Without it, well-known bin directories are scanned.
    #[serde(default)]
    pub binary_finder: Option<String>,
    /// Prints the package creation time as Unix seconds.
    #[serde(default)]
    pub creation_time: Option<String>,
}

fn default_extract_cmd() -> String {
    "dpkg -x {deb} {dest}".to_string()
}

fn default_build_log_cmd() -> Option<String> {
    Some("getbuildlog {package} last amd64".to_string())
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("harness_scratch")
}

fn default_command_timeout_secs() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            extract: default_extract_cmd(),
            build_log: default_build_log_cmd(),
            binary_finder: None,
            creation_time: None,
        }
    }
}

/// Harness settings file (YAML). Relative paths are resolved against the
/// directory holding the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessSettings {
    pub configs: ConfigSet<PathBuf>,
    /// Config used by the bisection oracle; defaults to `configs.source_only`.
    #[serde(default)]
    pub bisection_config: Option<PathBuf>,
    /// File listing the github.com repositories bisection may clone, one per line.
    #[serde(default)]
    pub github_whitelist: Option<PathBuf>,
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub commands: CommandSettings,
}

impl HarnessSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("Failed to read harness settings at {}", path.display()))?;
        let mut settings: HarnessSettings = serde_yaml::from_str(&body)
            .with_context(|| format!("Invalid harness settings at {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        settings.rebase(base);
        Ok(settings)
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.configs.full);
        join(&mut self.configs.without_build_log);
        join(&mut self.configs.without_binary);
        join(&mut self.configs.source_only);
        if let Some(p) = self.bisection_config.as_mut() {
            join(p);
        }
        if let Some(p) = self.github_whitelist.as_mut() {
            join(p);
        }
        join(&mut self.scratch_root);
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn load_configs(&self) -> Result<ConfigSet<ProbeConfig>> {
        Ok(ConfigSet {
            full: load_probe_config(&self.configs.full)?,
            without_build_log: load_probe_config(&self.configs.without_build_log)?,
            without_binary: load_probe_config(&self.configs.without_binary)?,
            source_only: load_probe_config(&self.configs.source_only)?,
        })
    }

    pub fn load_bisection_config(&self) -> Result<ProbeConfig> {
        load_probe_config(self.bisection_config.as_deref().unwrap_or(&self.configs.source_only))
    }

    pub fn load_whitelist(&self) -> Result<HashSet<String>> {
        match &self.github_whitelist {
            Some(path) => {
                let body = fs::read_to_string(path).with_context(|| {
                    format!("Failed to read github whitelist at {}", path.display())
                })?;
                Ok(parse_whitelist(&body))
            }
            None => Ok(HashSet::new()),
        }
    }
}

pub fn parse_whitelist(body: &str) -> HashSet<String> {
    body.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect()
}

/// github.com repositories must be whitelisted; other hosts are always allowed.
pub fn bisection_allowed(url: &str, whitelist: &HashSet<String>) -> bool {
    !url.contains("github.com") || whitelist.contains(url)
}

pub fn load_package_infos(path: &Path) -> Result<Vec<PackageInfo>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("Failed to read package infos at {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("Invalid package infos JSON at {}", path.display()))
}

/// Write records as a pretty JSON array followed by a newline.
pub fn write_records(path: &Path, records: &[PackageRecord]) -> Result<()> {
    let mut body = serde_json::to_string_pretty(records)?;
    body.push('\n');
    fs::write(path, body).with_context(|| format!("Failed to write results to {}", path.display()))
}

/// An extracted binary package with the single binary the detectors look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryArtifact {
    pub extraction_dir: PathBuf,
    /// Path of the binary relative to `extraction_dir`.
    pub binary: PathBuf,
}

impl BinaryArtifact {
    pub fn binary_path(&self) -> PathBuf {
        self.extraction_dir.join(&self.binary)
    }

    pub fn binary_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.binary.to_string_lossy().to_string())
    }
}

/// Acquires the artifacts for one package into the scratch layout.
pub trait ArtifactProvider {
    /// Extracted source tree. Failure skips the package.
    fn source_package(&self, info: &PackageInfo, layout: &ScratchLayout) -> Result<PathBuf>;

    /// The package's binary, or `None` when it does not ship exactly one.
    fn binary_package(
        &self,
        info: &PackageInfo,
        layout: &ScratchLayout,
    ) -> Result<Option<BinaryArtifact>>;

    fn build_log(&self, info: &PackageInfo, layout: &ScratchLayout) -> Result<Option<PathBuf>>;

    fn creation_date(&self, info: &PackageInfo) -> Result<Option<NaiveDate>>;
}

/// Default provider: runs the download commands from the package list and the
/// templates from [`CommandSettings`].
pub struct CommandArtifactProvider {
    commands: CommandSettings,
    timeout: Duration,
}

impl CommandArtifactProvider {
    pub fn new(commands: CommandSettings, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    fn run_in(&self, template: &str, dir: &Path, vars: &[(&str, &str)]) -> Result<String> {
        let args = render_template(template, vars);
        let (program, rest) =
            args.split_first().ok_or_else(|| anyhow!("empty command template '{template}'"))?;
        let mut command = Command::new(program);
        command.args(rest).current_dir(dir);
        Ok(run_tool_checked(&mut command, self.timeout)?)
    }

    /// Download commands exit non-zero on harmless warnings; only the
    /// resulting directory contents decide success.
    fn download_into(&self, template: &str, dir: &Path, info: &PackageInfo) -> Result<()> {
        let args = render_template(template, &package_vars(info));
        let (program, rest) =
            args.split_first().ok_or_else(|| anyhow!("empty download command '{template}'"))?;
        let mut command = Command::new(program);
        command.args(rest).current_dir(dir);
        let rendered = describe(&command);
        let output = run_tool(&mut command, self.timeout)?;
        if !output.success() {
            warn!(command = %rendered, code = ?output.code, "download command exited non-zero");
        }
        Ok(())
    }
}

impl ArtifactProvider for CommandArtifactProvider {
    fn source_package(&self, info: &PackageInfo, layout: &ScratchLayout) -> Result<PathBuf> {
        let cmd = info
            .download_source_cmd
            .as_deref()
            .ok_or_else(|| anyhow!("package {} has no download_source_cmd", info.package_name))?;
        self.download_into(cmd, &layout.source_dir, info)?;
        let dirs = list_entries(&layout.source_dir, |p| p.is_dir())?;
        match dirs.as_slice() {
            [single] => Ok(single.clone()),
            _ => bail!("package source could not be extracted ({} directories)", dirs.len()),
        }
    }

    fn binary_package(
        &self,
        info: &PackageInfo,
        layout: &ScratchLayout,
    ) -> Result<Option<BinaryArtifact>> {
        let Some(cmd) = info.download_binary_cmd.as_deref() else {
            return Ok(None);
        };
        self.download_into(cmd, &layout.binary_dir, info)?;
        let files = list_entries(&layout.binary_dir, |p| p.is_file())?;
        let [deb] = files.as_slice() else {
            bail!("binary package could not be downloaded ({} files)", files.len());
        };
        fs::create_dir_all(&layout.extraction_dir)?;
        let deb = deb.to_string_lossy().to_string();
        let dest = layout.extraction_dir.to_string_lossy().to_string();
        let vars = [("deb", deb.as_str()), ("dest", dest.as_str())];
        self.run_in(&self.commands.extract, &layout.binary_dir, &vars)?;

        let binaries = match &self.commands.binary_finder {
            Some(finder) => self
                .run_in(finder, &layout.extraction_dir, &[])?
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect(),
            None => find_binaries(&layout.extraction_dir)?,
        };
        if binaries.len() != 1 {
            let count = binaries.len();
            info!(package = %info.package_name, binaries = count, "not exactly one binary");
            return Ok(None);
        }
        Ok(binaries
            .into_iter()
            .next()
            .map(|binary| BinaryArtifact { extraction_dir: layout.extraction_dir.clone(), binary }))
    }

    fn build_log(&self, info: &PackageInfo, layout: &ScratchLayout) -> Result<Option<PathBuf>> {
        let Some(template) = self.commands.build_log.as_deref() else {
            return Ok(None);
        };
        self.download_into(template, &layout.build_log_dir, info)?;
        let files = list_entries(&layout.build_log_dir, |p| p.is_file())?;
        match files.as_slice() {
            [single] => Ok(Some(single.clone())),
            _ => bail!("build log could not be downloaded ({} files)", files.len()),
        }
    }

    fn creation_date(&self, info: &PackageInfo) -> Result<Option<NaiveDate>> {
        let Some(template) = self.commands.creation_time.as_deref() else {
            return Ok(None);
        };
        let stdout = self.run_in(template, Path::new("."), &package_vars(info))?;
        let secs: i64 = stdout
            .trim()
            .parse()
            .with_context(|| format!("creation time is not Unix seconds: '{}'", stdout.trim()))?;
        let when = DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| anyhow!("creation time {secs} is out of range"))?;
        Ok(Some(when.with_timezone(&Local).date_naive()))
    }
}

fn package_vars(info: &PackageInfo) -> [(&str, &str); 2] {
    [("package", info.package_name.as_str()), ("version", info.version_number.as_str())]
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            vars.iter().fold(token.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect()
}

fn list_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if keep(&path) {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

/// Regular files in the usual executable directories, relative to `root`.
pub fn find_binaries(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for dir in BINARY_DIRS {
        let dir = root.join(dir);
        if !dir.is_dir() {
            continue;
        }
        for path in list_entries(&dir, |p| p.is_file())? {
            if let Ok(relative) = path.strip_prefix(root) {
                found.push(relative.to_path_buf());
            }
        }
    }
    Ok(found)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarnessOptions {
    pub start_offset: usize,
    /// Stop after this many successful records.
    pub count: Option<usize>,
    pub skip_bisect: bool,
}

/// Sequential batch driver over a package list.
pub struct DetectionHarness<'a, P: ArtifactProvider> {
    configs: &'a ConfigSet<ProbeConfig>,
    bisection: &'a ProbeConfig,
    kinds: &'a KindRegistry,
    whitelist: HashSet<String>,
    layout: ScratchLayout,
    provider: P,
    options: HarnessOptions,
    git: PathBuf,
    git_timeout: Duration,
}

impl<'a, P: ArtifactProvider> DetectionHarness<'a, P> {
    pub fn new(
        configs: &'a ConfigSet<ProbeConfig>,
        bisection: &'a ProbeConfig,
        kinds: &'a KindRegistry,
        layout: ScratchLayout,
        provider: P,
    ) -> Self {
        Self {
            configs,
            bisection,
            kinds,
            whitelist: HashSet::new(),
            layout,
            provider,
            options: HarnessOptions::default(),
            git: resolve_tool(None, "GIT_BIN", "git"),
            git_timeout: bisection.tool_timeout(),
        }
    }

    pub fn with_whitelist(mut self, whitelist: HashSet<String>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_options(mut self, options: HarnessOptions) -> Self {
        self.options = options;
        self
    }

    /// Git executable used to clone and bisect repositories.
    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    /// Process packages from `start_offset` until `count` records exist.
    ///
    /// Only a scratch directory that cannot be recreated stops the batch.
    pub fn run(&self, packages: &[PackageInfo]) -> Result<Vec<PackageRecord>> {
        let mut records = Vec::new();
        for info in packages.iter().skip(self.options.start_offset) {
            if self.options.count.is_some_and(|count| records.len() >= count) {
                break;
            }
            info!(
                source = %info.source,
                rank = info.rank,
                package = %info.package_name,
                "running tool on package"
            );
            self.layout.reset().with_context(|| {
                let root = self.layout.root.display();
                format!("Failed to prepare scratch directories under {root}")
            })?;
            let outcome = self.process(info);
            if let Err(err) = self.layout.teardown() {
                warn!(error = %err, "failed to clean scratch directories");
            }
            match outcome {
                Ok(record) => {
                    info!(package = %info.package_name, "added detection results for package");
                    records.push(record);
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!(package = %info.package_name, error = %error, "package skipped")
                }
            }
        }
        Ok(records)
    }

    fn process(&self, info: &PackageInfo) -> Result<PackageRecord> {
        let source_dir = self.provider.source_package(info, &self.layout)?;
        let binary = self.provider.binary_package(info, &self.layout)?;
        let build_log = self.provider.build_log(info, &self.layout).unwrap_or_else(|err| {
            warn!(package = %info.package_name, error = %err, "no build log");
            None
        });
        let creation_date = self.provider.creation_date(info).unwrap_or_else(|err| {
            warn!(package = %info.package_name, error = %err, "no creation time");
            None
        });

        let mut inputs = DetectionInputs::default().with_source_dir(source_dir);
        if let Some(binary) = &binary {
            inputs = inputs.with_binary(binary.binary_path(), binary.binary_name());
        }
        if let Some(log) = &build_log {
            inputs = inputs.with_build_log(log);
        }
        let config = self.configs.select(binary.is_some(), build_log.is_some());
        let record = Runner::new(config, self.kinds, inputs)
            .run(&[])
            .with_context(|| format!("Detection failed for {}", info.package_name))?;

        let git_bisection_data = match &info.git_repo_url {
            Some(url) if !self.options.skip_bisect && bisection_allowed(url, &self.whitelist) => {
                self.bisect_repository(url)
            }
            _ => None,
        };

        Ok(PackageRecord {
            package_name: info.package_name.clone(),
            rank: info.rank,
            source: info.source.clone(),
            version_number: info.version_number.clone(),
            data_collection_timestamp: Local::now().format(TIMESTAMP_FMT).to_string(),
            detection_tool_output: serde_json::to_value(&record)?,
            creation_date: creation_date.map(|d| d.format(DATE_FMT).to_string()),
            git_bisection_data,
            maintainer: info.maintainer.clone(),
        })
    }

    /// Clone failures and per-feature errors are logged and yield no attribution.
    fn bisect_repository(&self, url: &str) -> Option<BisectionData> {
        match self.try_bisect_repository(url) {
            Ok(data) => Some(data),
            Err(err) => {
                warn!(url, error = %format!("{err:#}"), "failed to run git bisection");
                None
            }
        }
    }

    fn try_bisect_repository(&self, url: &str) -> Result<BisectionData> {
        let tree =
            GitWorkTree::clone_with(&self.git, url, &self.layout.git_dir, self.git_timeout)?;
        let head = tree.head_commit()?;
        let first = tree.root_commit(&head)?;
        let creation_timestamp = tree.commit_date(&first)?.format(DATE_FMT).to_string();

        let mut features = BTreeMap::new();
        for feature in &self.bisection.features_selected {
            match bisect_feature(&tree, self.bisection, self.kinds, feature, &first, &head) {
                Ok(BisectOutcome::Introduced { commit, .. }) => match tree.commit_date(&commit) {
                    Ok(date) => {
                        let timestamp = date.format(DATE_FMT).to_string();
                        features.insert(feature.clone(), FeatureIntroduction { commit, timestamp });
                    }
                    Err(err) => {
                        let commit = commit.as_str();
                        warn!(url, feature = %feature, commit, error = %err, "no commit date")
                    }
                },
                Ok(BisectOutcome::NotFound { reason, .. }) => {
                    info!(url, feature = %feature, reason = ?reason, "feature not attributed")
                }
                Err(err) => warn!(url, feature = %feature, error = %err, "bisection step failed"),
            }
        }
        Ok(BisectionData { git_repo_url: url.to_string(), creation_timestamp, features })
    }
}
