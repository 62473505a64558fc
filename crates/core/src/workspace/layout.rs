use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Logical layout of the harness scratch directories.
///
/// Computing a layout does no IO; [`ScratchLayout::reset`] and
/// [`ScratchLayout::teardown`] do.
#[derive(Debug, Clone)]
pub struct ScratchLayout {
    /// Root all scratch directories live under.
    pub root: PathBuf,
    /// Downloaded and extracted source package.
    pub source_dir: PathBuf,
    /// Downloaded binary package.
    pub binary_dir: PathBuf,
    /// Binary package contents after extraction.
    pub extraction_dir: PathBuf,
    /// Downloaded build log.
    pub build_log_dir: PathBuf,
    /// Clone used for bisection. Created by the clone itself, not by `reset`.
    pub git_dir: PathBuf,
}

impl ScratchLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let source_dir = root.join("source_package_downloads");
        let binary_dir = root.join("binary_package_downloads");
        let extraction_dir = binary_dir.join("extraction_root");
        let build_log_dir = root.join("build_log_dir");
        let git_dir = root.join("git_bisection_repo");
        Self { root, source_dir, binary_dir, extraction_dir, build_log_dir, git_dir }
    }

    /// Directories recreated for every package.
    pub fn package_dirs(&self) -> [&Path; 3] {
        [&self.source_dir, &self.binary_dir, &self.build_log_dir]
    }

    /// Remove leftovers from a previous package and create empty directories.
    pub fn reset(&self) -> io::Result<()> {
        self.teardown()?;
        for dir in self.package_dirs() {
            fs::create_dir_all(dir)?;
        }
        debug!(root = %self.root.display(), "scratch directories reset");
        Ok(())
    }

    /// Remove every scratch directory, including a leftover git clone.
    pub fn teardown(&self) -> io::Result<()> {
        for dir in self.package_dirs().into_iter().chain([self.git_dir.as_path()]) {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    let path = dir.display();
                    warn!(path = %path, error = %err, "failed to remove scratch directory");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}
