//! A git checkout driven through the `git` executable.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::services::detection::ProbeError;
use crate::services::tool::{describe, failed, resolve_tool, run_tool, run_tool_checked};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ownership {
    /// The caller's checkout; never checked out into or removed.
    Borrowed,
    /// A clone removed on drop.
    Clone,
    /// A linked worktree of the repository at the given path, removed and
    /// pruned on drop.
    Linked(PathBuf),
}

/// A working tree the bisection engine checks commits out into.
///
/// Trees created by [`GitWorkTree::clone_from`] and
/// [`GitWorkTree::scratch_worktree`] own their directory and remove it when
/// dropped. A tree created by [`GitWorkTree::open`] belongs to the caller and
/// is left in place.
#[derive(Debug)]
pub struct GitWorkTree {
    root: PathBuf,
    git: PathBuf,
    timeout: Duration,
    ownership: Ownership,
}

impl GitWorkTree {
    /// Clone `url` into `dest`; the returned tree owns `dest`.
    pub fn clone_from(url: &str, dest: &Path, timeout: Duration) -> Result<Self, ProbeError> {
        Self::clone_with(resolve_tool(None, "GIT_BIN", "git"), url, dest, timeout)
    }

    /// [`GitWorkTree::clone_from`] with an explicit git executable.
    pub fn clone_with(
        git: impl Into<PathBuf>,
        url: &str,
        dest: &Path,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let git = git.into();
        let mut command = Command::new(&git);
        command.arg("clone").arg("--quiet").arg(url).arg(dest);
        run_tool_checked(&mut command, timeout)?;
        info!(url, path = %dest.display(), "cloned repository");
        Ok(Self { root: dest.to_path_buf(), git, timeout, ownership: Ownership::Clone })
    }

    /// Add a detached linked worktree at `dest` sharing this repository's
    /// objects. The returned tree owns `dest`; this tree is not touched.
    pub fn scratch_worktree(&self, dest: &Path) -> Result<Self, ProbeError> {
        let mut command = self.command(&["worktree", "add", "--detach", "--quiet"]);
        command.arg(dest).arg("HEAD");
        run_tool_checked(&mut command, self.timeout)?;
        debug!(repo = %self.root.display(), path = %dest.display(), "added scratch worktree");
        Ok(Self {
            root: dest.to_path_buf(),
            git: self.git.clone(),
            timeout: self.timeout,
            ownership: Ownership::Linked(self.root.clone()),
        })
    }

    /// Whether this tree's directory may be checked out into and cleaned.
    pub fn is_owned(&self) -> bool {
        self.ownership != Ownership::Borrowed
    }

    /// Use an existing checkout at `path` without taking ownership of it.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, ProbeError> {
        let tree = Self {
            root: path.to_path_buf(),
            git: resolve_tool(None, "GIT_BIN", "git"),
            timeout,
            ownership: Ownership::Borrowed,
        };
        tree.git(&["rev-parse", "--git-dir"])?;
        Ok(tree)
    }

    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve any revision (branch, tag, abbreviated hash) to a full commit hash.
    pub fn resolve(&self, rev: &str) -> Result<String, ProbeError> {
        let spec = format!("{rev}^{{commit}}");
        self.single_line(&["rev-parse", "--verify", "--quiet", &spec])
    }

    pub fn head_commit(&self) -> Result<String, ProbeError> {
        self.resolve("HEAD")
    }

    /// The first commit on the first-parent line leading to `rev`.
    pub fn root_commit(&self, rev: &str) -> Result<String, ProbeError> {
        let stdout = self.git(&["rev-list", "--first-parent", "--max-parents=0", rev])?;
        stdout.lines().last().map(str::to_string).ok_or_else(|| ProbeError::ToolOutput {
            tool: "git rev-list".to_string(),
            message: format!("no root commit reachable from {rev}"),
        })
    }

    /// The branch currently checked out, or the detached commit hash.
    pub fn current_ref(&self) -> Result<String, ProbeError> {
        let mut command = self.command(&["symbolic-ref", "--short", "-q", "HEAD"]);
        match run_tool_checked(&mut command, self.timeout) {
            Ok(stdout) if !stdout.trim().is_empty() => Ok(stdout.trim().to_string()),
            _ => self.head_commit(),
        }
    }

    /// Whether `ancestor` is reachable from `descendant` (a commit is its own
    /// ancestor).
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, ProbeError> {
        let mut command = self.command(&["merge-base", "--is-ancestor", ancestor, descendant]);
        let rendered = describe(&command);
        let output = run_tool(&mut command, self.timeout)?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failed(&rendered, &output)),
        }
    }

    /// Commits on the first-parent path from `old` to `new`, oldest first,
    /// with `old` itself at index 0. `old` must be an ancestor of `new`.
    pub fn first_parent_range(&self, old: &str, new: &str) -> Result<Vec<String>, ProbeError> {
        let old = self.resolve(old)?;
        let new = self.resolve(new)?;
        if !self.is_ancestor(&old, &new)? {
            return Err(ProbeError::InvalidConfig(format!(
                "bisection range is not linear: {old} is not an ancestor of {new}"
            )));
        }
        let range = format!("{old}..{new}");
        let stdout = self.git(&["rev-list", "--first-parent", "--reverse", &range])?;
        let mut history = vec![old];
        history.extend(stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
        debug!(commits = history.len(), "collected first-parent history");
        Ok(history)
    }

    /// Force the tree to `commit` and drop untracked and ignored files.
    pub fn checkout(&self, commit: &str) -> Result<(), ProbeError> {
        self.git(&["checkout", "--quiet", "--force", commit])?;
        self.git(&["clean", "-fdxq"])?;
        debug!(commit, "checked out");
        Ok(())
    }

    /// Author date of `commit`, in the author's time zone.
    pub fn commit_date(&self, commit: &str) -> Result<NaiveDate, ProbeError> {
        let line = self.single_line(&["log", "-1", "--format=%ad", "--date=short", commit])?;
        NaiveDate::parse_from_str(&line, "%Y-%m-%d").map_err(|e| ProbeError::ToolOutput {
            tool: "git log".to_string(),
            message: format!("unparseable date '{line}': {e}"),
        })
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.git);
        command.arg("-C").arg(&self.root).args(args);
        command
    }

    fn git(&self, args: &[&str]) -> Result<String, ProbeError> {
        let mut command = self.command(args);
        run_tool_checked(&mut command, self.timeout)
    }

    fn single_line(&self, args: &[&str]) -> Result<String, ProbeError> {
        let mut command = self.command(args);
        let rendered = describe(&command);
        let stdout = run_tool_checked(&mut command, self.timeout)?;
        let line = stdout.trim();
        if line.is_empty() || line.contains('\n') {
            return Err(ProbeError::ToolOutput {
                tool: rendered,
                message: format!("expected one line, got '{line}'"),
            });
        }
        Ok(line.to_string())
    }
}

impl Drop for GitWorkTree {
    fn drop(&mut self) {
        if !self.is_owned() {
            return;
        }
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(path = %self.root.display(), "removed working tree"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.root.display(), error = %err, "failed to remove working tree")
            }
        }
        if let Ownership::Linked(repo) = &self.ownership {
            let mut command = Command::new(&self.git);
            command.arg("-C").arg(repo).args(["worktree", "prune"]);
            if let Err(err) = run_tool_checked(&mut command, self.timeout) {
                warn!(repo = %repo.display(), error = %err, "failed to prune worktrees");
            }
        }
    }
}
