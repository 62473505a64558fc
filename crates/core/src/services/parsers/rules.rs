use std::cell::OnceCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::services::detection::{ParseOutput, ParseSelector, Parser, ProbeError};
use crate::services::tool::{describe, run_tool_checked};

/// Make rule appended to the copied rules file; `make print-FOO` echoes `FOO = <value>`.
const PRINT_RULE: &str = "print-%  : ; @echo $* = $($*)";

/// Default location of the rules makefile relative to the source tree.
pub const DEFAULT_RULES_FILE: &str = "debian/rules";

struct PreparedRules {
    // Keeps the directory alive for as long as the parser lives.
    _dir: TempDir,
    makefile: PathBuf,
}

/// Queries variables out of a package's rules makefile.
///
/// Setup copies the rules file into a private temp dir and appends a
/// `print-%` rule; that copy is the only cached state. Every
/// `Variable(name)` query runs `make` again.
pub struct RulesVariableParser {
    name: String,
    source_dir: PathBuf,
    rules_file: PathBuf,
    make: PathBuf,
    timeout: Duration,
    prepared: OnceCell<PreparedRules>,
}

impl RulesVariableParser {
    pub fn new(
        name: impl Into<String>,
        source_dir: PathBuf,
        rules_file: PathBuf,
        make: PathBuf,
        timeout: Duration,
    ) -> Self {
        let name = name.into();
        info!(parser = %name, rules = %rules_file.display(), "rules-variable parser created");
        Self { name, source_dir, rules_file, make, timeout, prepared: OnceCell::new() }
    }

    fn prepared(&self) -> Result<&PreparedRules, ProbeError> {
        if let Some(prepared) = self.prepared.get() {
            return Ok(prepared);
        }
        let prepared = prepare_rules_copy(&self.rules_file)?;
        info!(
            parser = %self.name,
            copy = %prepared.makefile.display(),
            "rules-variable parser set up"
        );
        Ok(self.prepared.get_or_init(|| prepared))
    }

    fn variable(&self, variable: &str) -> Result<String, ProbeError> {
        let prepared = self.prepared()?;
        let mut command = Command::new(&self.make);
        command
            .arg("-s")
            .arg("-C")
            .arg(&self.source_dir)
            .arg("-f")
            .arg(&prepared.makefile)
            .arg(format!("print-{variable}"));
        let rendered = describe(&command);
        let stdout = run_tool_checked(&mut command, self.timeout)?;
        let value = extract_variable_line(&stdout, variable)
            .map_err(|message| ProbeError::ToolOutput { tool: rendered, message })?;
        debug!(parser = %self.name, variable, value = %value, "queried rules variable");
        Ok(value)
    }
}

impl Parser for RulesVariableParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&self, selector: &ParseSelector) -> Result<ParseOutput, ProbeError> {
        match selector {
            ParseSelector::Variable(variable) => Ok(ParseOutput::Value(self.variable(variable)?)),
            other => Err(ProbeError::UnsupportedSelector {
                parser: self.name.clone(),
                selector: other.to_string(),
            }),
        }
    }
}

fn prepare_rules_copy(rules_file: &Path) -> Result<PreparedRules, ProbeError> {
    if !rules_file.is_file() {
        return Err(ProbeError::io(
            rules_file,
            std::io::Error::new(std::io::ErrorKind::NotFound, "rules file is not a file"),
        ));
    }
    let dir = tempfile::Builder::new()
        .prefix("rules-parser")
        .tempdir()
        .map_err(|e| ProbeError::io(std::env::temp_dir(), e))?;
    let makefile = dir.path().join("rules");
    fs::copy(rules_file, &makefile).map_err(|e| ProbeError::io(rules_file, e))?;
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(&makefile)
        .map_err(|e| ProbeError::io(&makefile, e))?;
    writeln!(file, "\n{PRINT_RULE}").map_err(|e| ProbeError::io(&makefile, e))?;
    Ok(PreparedRules { _dir: dir, makefile })
}

/// Pick the single `NAME = value` line from `make print-NAME` output.
///
/// Returns the whole line, as consumers match flags against it.
pub fn extract_variable_line(stdout: &str, variable: &str) -> Result<String, String> {
    let prefix = format!("{variable} =");
    let matches: Vec<&str> = stdout.lines().filter(|line| line.starts_with(&prefix)).collect();
    match matches.as_slice() {
        [line] => Ok(line.to_string()),
        [] => Err(format!("no line for variable {variable}")),
        many => Err(format!("{} lines for variable {variable}", many.len())),
    }
}
