use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub mod commands;

/// Canonicalize `path` if possible, falling back to the path joined onto
/// the current working directory (for outputs that do not exist yet).
pub fn canonicalize_or_current(path: &Path) -> Result<PathBuf> {
    if path == Path::new(".") {
        return env::current_dir().context("Failed to get current directory");
    }
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => {
            let cwd = env::current_dir().context("Failed to get current directory")?;
            Ok(cwd.join(path))
        }
    }
}

/// Validate that `path` (given via `flag`) is an existing directory.
pub fn existing_dir(flag: &str, path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        bail!("{flag}: directory does not exist: {}", path.display());
    }
    if !path.is_dir() {
        bail!("{flag}: not a directory: {}", path.display());
    }
    path.canonicalize().with_context(|| format!("{flag}: cannot resolve {}", path.display()))
}

/// Validate that `path` (given via `flag`) is an existing regular file.
pub fn existing_file(flag: &str, path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        bail!("{flag}: file does not exist: {}", path.display());
    }
    if !path.is_file() {
        bail!("{flag}: not a file: {}", path.display());
    }
    path.canonicalize().with_context(|| format!("{flag}: cannot resolve {}", path.display()))
}
