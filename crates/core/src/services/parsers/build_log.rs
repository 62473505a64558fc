use std::cell::OnceCell;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::services::detection::{BuildStage, ParseOutput, ParseSelector, Parser, ProbeError};

/// `-DNAME=value` definitions, dropped before classification.
static DEFINED_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-D\w*=\S+").expect("valid regex"));
static OBJECT_COMPILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^g\+\+ (.* )?-c\b").expect("valid regex"));

/// Compiler lines from a build log, bucketed by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerLines {
    /// Every `g++ ` line, after `-DNAME=value` stripping.
    pub all: Vec<String>,
    /// Lines producing the final binary (`-o <binary>`).
    pub linker: Vec<String>,
    /// Lines compiling object files (`g++ ... -c`).
    pub objects: Vec<String>,
    pub others: Vec<String>,
}

impl CompilerLines {
    /// Classify the `g++` invocations in a build log body.
    ///
    /// With a binary name, a linker line is one containing `-o <name>`
    /// (case-insensitive). Without one, any `-o` line that is not an object
    /// compile counts.
    pub fn classify(body: &str, binary_name: Option<&str>) -> Self {
        let linker_flag = binary_name.map(|name| format!("-o {}", name.to_lowercase()));

        let mut lines = CompilerLines::default();
        for raw in body.lines() {
            if !raw.starts_with("g++ ") {
                continue;
            }
            let line = DEFINED_FLAG.replace_all(raw, "").to_string();
            if line != raw {
                debug!(before = raw, after = %line, "stripped -D definitions");
            }
            let lowered = line.to_lowercase();
            let is_object = OBJECT_COMPILE.is_match(&line);
            let is_linker = match &linker_flag {
                Some(flag) => lowered.contains(flag.as_str()),
                None => !is_object && lowered.contains("-o "),
            };
            if is_linker {
                lines.linker.push(line.clone());
            } else if is_object {
                lines.objects.push(line.clone());
            } else {
                lines.others.push(line.clone());
            }
            lines.all.push(line);
        }
        lines
    }

    pub fn stage(&self, stage: BuildStage) -> &[String] {
        match stage {
            BuildStage::Linker => &self.linker,
            BuildStage::Objects => &self.objects,
            BuildStage::Others => &self.others,
            BuildStage::All => &self.all,
        }
    }
}

/// Parser over a compiler build log. The log is read and classified once, on
/// the first `parse` call.
pub struct BuildLogParser {
    name: String,
    build_log: PathBuf,
    binary_name: Option<String>,
    lines: OnceCell<CompilerLines>,
}

impl BuildLogParser {
    pub fn new(name: impl Into<String>, build_log: PathBuf, binary_name: Option<String>) -> Self {
        let name = name.into();
        info!(parser = %name, log = %build_log.display(), "build-log parser created");
        Self { name, build_log, binary_name, lines: OnceCell::new() }
    }

    fn lines(&self) -> Result<&CompilerLines, ProbeError> {
        if let Some(lines) = self.lines.get() {
            return Ok(lines);
        }
        if !self.build_log.is_file() {
            return Err(ProbeError::io(
                &self.build_log,
                std::io::Error::new(std::io::ErrorKind::NotFound, "build log is not a file"),
            ));
        }
        let body = fs::read(&self.build_log).map_err(|e| ProbeError::io(&self.build_log, e))?;
        let body = String::from_utf8_lossy(&body);
        let classified = CompilerLines::classify(&body, self.binary_name.as_deref());
        info!(
            parser = %self.name,
            compiler_lines = classified.all.len(),
            linker_lines = classified.linker.len(),
            "build-log parser set up"
        );
        Ok(self.lines.get_or_init(|| classified))
    }
}

impl Parser for BuildLogParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&self, selector: &ParseSelector) -> Result<ParseOutput, ProbeError> {
        let ParseSelector::Stage(stage) = selector else {
            return Err(ProbeError::UnsupportedSelector {
                parser: self.name.clone(),
                selector: selector.to_string(),
            });
        };
        let lines = self.lines()?;
        if *stage == BuildStage::Linker && lines.linker.len() > 1 {
            warn!(
                parser = %self.name,
                count = lines.linker.len(),
                "expected a single linking line for the binary"
            );
        }
        Ok(ParseOutput::Lines(lines.stage(*stage).to_vec()))
    }
}
