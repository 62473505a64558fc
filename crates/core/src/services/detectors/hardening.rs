use std::cell::{Cell, OnceCell};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::model::FeatureValue;
use crate::services::detection::{Detector, ProbeError};
use crate::services::tool::{describe, failed, run_tool};

/// Feature id that returns every reported protection at once.
pub const ALL_PROTECTIONS: &str = "hardening";

/// Feature id -> label printed by `hardening-check`.
pub const PROTECTION_LABELS: [(&str, &str); 7] = [
    ("ro-relocation", "Read-only relocations"),
    ("stack-protector", "Stack protected"),
    ("fortify-source", "Fortify Source functions"),
    ("PIE", "Position Independent Executable"),
    ("immediate-binding", "Immediate binding"),
    ("stack-clash", "Stack clash protection"),
    ("control-flow-integrity", "Control flow integrity"),
];

pub fn protection_label(feature: &str) -> Option<&'static str> {
    PROTECTION_LABELS.iter().find(|(id, _)| *id == feature).map(|(_, label)| *label)
}

/// Runs `hardening-check` against the binary once per run and answers every
/// protection feature from the cached report.
pub struct HardeningDetector {
    name: String,
    binary: PathBuf,
    tool: PathBuf,
    timeout: Duration,
    report: OnceCell<BTreeMap<String, String>>,
    invocations: Cell<usize>,
}

impl HardeningDetector {
    pub fn new(name: impl Into<String>, binary: PathBuf, tool: PathBuf, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            binary,
            tool,
            timeout,
            report: OnceCell::new(),
            invocations: Cell::new(0),
        }
    }

    /// How many times the audit tool has been spawned by this instance.
    pub fn invocations(&self) -> usize {
        self.invocations.get()
    }

    fn report(&self) -> Result<&BTreeMap<String, String>, ProbeError> {
        if let Some(report) = self.report.get() {
            return Ok(report);
        }
        let mut command = Command::new(&self.tool);
        command.arg(&self.binary);
        let rendered = describe(&command);
        self.invocations.set(self.invocations.get() + 1);
        let output = run_tool(&mut command, self.timeout)?;
        // Exit status 1 only means some protection is missing.
        if !matches!(output.code, Some(0) | Some(1)) {
            return Err(failed(&rendered, &output));
        }
        let report = parse_report(&output.stdout);
        debug!(detector = %self.name, entries = report.len(), "parsed hardening report");
        Ok(self.report.get_or_init(|| report))
    }
}

/// Parse `hardening-check` output: a header line naming the binary, then
/// ` Label: status` lines.
pub fn parse_report(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(label, status)| (label.trim().to_string(), status.trim().to_string()))
        .filter(|(label, _)| !label.is_empty())
        .collect()
}

impl Detector for HardeningDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, feature: &str) -> Result<FeatureValue, ProbeError> {
        let report = self.report()?;
        let value = if feature == ALL_PROTECTIONS {
            FeatureValue::Table(report.clone())
        } else {
            let label = protection_label(feature).ok_or_else(|| ProbeError::UnsupportedFeature {
                detector: self.name.clone(),
                feature: feature.to_string(),
            })?;
            let status = report.get(label).ok_or_else(|| ProbeError::ToolOutput {
                tool: self.tool.display().to_string(),
                message: format!("report has no '{label}' entry"),
            })?;
            FeatureValue::Text(status.clone())
        };
        debug!(detector = %self.name, feature, ?value, "ran detector");
        Ok(value)
    }
}
