use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::model::FeatureValue;
use crate::services::detection::{Detector, ProbeError};
use crate::services::tool::{describe, failed, run_tool};

/// grep: no line matched.
pub const GREP_NOT_FOUND: i32 = 1;
/// grep: an error occurred (bad pattern, unreadable tree, ...).
pub const GREP_ERROR: i32 = 2;

/// File globs searched in the source tree.
pub const DEFAULT_INCLUDES: [&str; 2] = ["*.h", "*.cpp"];

pub const NAMED_CAST_PATTERNS: [(&str, &str); 4] = [
    ("const_cast", "const_cast<.+>"),
    ("dynamic_cast", "dynamic_cast<.+>"),
    ("static_cast", "static_cast<.+>"),
    ("reinterpret_cast", "reinterpret_cast<.+>"),
];

pub const SMART_POINTER_PATTERNS: [(&str, &str); 7] = [
    ("unique_ptr", "unique_ptr<.+>"),
    ("shared_ptr", "shared_ptr<.+>"),
    ("weak_ptr", "weak_ptr<.+>"),
    // Boost pointers that do not clash with the standard library names.
    ("scoped_ptr", "scoped_ptr<.+>"),
    ("scoped_array", "scoped_array<.+>"),
    ("shared_array", "shared_array<.+>"),
    ("intrusive_ptr", "intrusive_ptr<.+>"),
];

/// Counts source lines matching a per-feature extended regex, by running a
/// case-insensitive recursive `grep` over the tree.
pub struct SourcePatternDetector {
    name: String,
    source_dir: PathBuf,
    patterns: BTreeMap<String, String>,
    includes: Vec<String>,
    grep: PathBuf,
    timeout: Duration,
}

impl SourcePatternDetector {
    pub fn new(
        name: impl Into<String>,
        source_dir: PathBuf,
        patterns: BTreeMap<String, String>,
        grep: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source_dir,
            patterns,
            includes: DEFAULT_INCLUDES.iter().map(|s| s.to_string()).collect(),
            grep,
            timeout,
        }
    }

    pub fn with_includes(mut self, includes: Vec<String>) -> Self {
        if !includes.is_empty() {
            self.includes = includes;
        }
        self
    }

    fn count_matches(&self, pattern: &str) -> Result<u64, ProbeError> {
        let mut command = Command::new(&self.grep);
        command.arg("-i").arg("-r");
        for include in &self.includes {
            command.arg("--include").arg(include);
        }
        command.arg("-E").arg(pattern).arg(&self.source_dir);
        let rendered = describe(&command);

        let output = run_tool(&mut command, self.timeout)?;
        match output.code {
            Some(0) => Ok(count_lines(&output.stdout)),
            Some(GREP_NOT_FOUND) => Ok(0),
            _ => Err(failed(&rendered, &output)),
        }
    }
}

/// Number of non-empty output lines. One line per matching source line, so
/// the count is approximate for lines with several hits.
pub fn count_lines(stdout: &str) -> u64 {
    stdout.lines().filter(|line| !line.is_empty()).count() as u64
}

pub fn pattern_table(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries.iter().map(|(feature, re)| (feature.to_string(), re.to_string())).collect()
}

impl Detector for SourcePatternDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, feature: &str) -> Result<FeatureValue, ProbeError> {
        let pattern = self.patterns.get(feature).ok_or_else(|| ProbeError::UnsupportedFeature {
            detector: self.name.clone(),
            feature: feature.to_string(),
        })?;
        let count = self.count_matches(pattern)?;
        let value = FeatureValue::occurrences(count);
        debug!(detector = %self.name, feature, occurrences = count, "ran detector");
        Ok(value)
    }
}
