use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::FeatureValue;

/// One of the artifacts a caller can hand to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    BinaryPath,
    SourceDir,
    BuildLog,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InputKind::BinaryPath => "binary path",
            InputKind::SourceDir => "source directory",
            InputKind::BuildLog => "build log",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("No detector provides requested feature '{0}'")]
    MissingFeatureProducer(String),
    #[error("Feature '{feature}' is claimed by both '{first}' and '{second}'")]
    DuplicateFeatureClaim { feature: String, first: String, second: String },
    #[error("Detector '{detector}' references unknown parser '{parser}'")]
    UnresolvedParserReference { detector: String, parser: String },
    #[error("Detector kind '{kind}' requires a {input}, which was not supplied")]
    MissingPrerequisite { kind: String, input: InputKind },
    #[error("Unknown detector kind '{0}'")]
    UnknownDetectorKind(String),
    #[error("Unknown parser kind '{0}'")]
    UnknownParserKind(String),
    #[error("Invalid probe config: {0}")]
    InvalidConfig(String),
    #[error("Detector '{detector}' cannot answer feature '{feature}'")]
    UnsupportedFeature { detector: String, feature: String },
    #[error("Parser '{parser}' does not support selector {selector}")]
    UnsupportedSelector { parser: String, selector: String },
    #[error("Failed to spawn {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with status {status}: {stderr}")]
    ToolFailed { command: String, status: String, stderr: String },
    #[error("{command} did not finish within {seconds}s")]
    ToolTimeout { command: String, seconds: u64 },
    #[error("Unexpected output from {tool}: {message}")]
    ToolOutput { tool: String, message: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProbeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProbeError::Io { path: path.into(), source }
    }

    /// Configuration errors are deterministic; retrying them cannot help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProbeError::MissingFeatureProducer(_)
                | ProbeError::DuplicateFeatureClaim { .. }
                | ProbeError::UnresolvedParserReference { .. }
                | ProbeError::MissingPrerequisite { .. }
                | ProbeError::UnknownDetectorKind(_)
                | ProbeError::UnknownParserKind(_)
                | ProbeError::InvalidConfig(_)
        )
    }
}

/// Artifacts available for one run. Every field is optional; each detector or
/// parser kind asks for the ones it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionInputs {
    pub binary_path: Option<PathBuf>,
    pub binary_name: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub build_log: Option<PathBuf>,
}

impl DetectionInputs {
    /// Inputs used by the bisection oracle: only a checked-out source tree.
    pub fn source_only(dir: impl Into<PathBuf>) -> Self {
        Self { source_dir: Some(dir.into()), ..Self::default() }
    }

    pub fn with_binary(mut self, path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        self.binary_path = Some(path.into());
        self.binary_name = Some(name.into());
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn with_build_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_log = Some(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.binary_path.is_none() && self.source_dir.is_none() && self.build_log.is_none()
    }

    pub fn require_binary_path(&self, kind: &str) -> Result<&Path, ProbeError> {
        self.binary_path.as_deref().ok_or_else(|| missing(kind, InputKind::BinaryPath))
    }

    pub fn require_source_dir(&self, kind: &str) -> Result<&Path, ProbeError> {
        self.source_dir.as_deref().ok_or_else(|| missing(kind, InputKind::SourceDir))
    }

    pub fn require_build_log(&self, kind: &str) -> Result<&Path, ProbeError> {
        self.build_log.as_deref().ok_or_else(|| missing(kind, InputKind::BuildLog))
    }
}

fn missing(kind: &str, input: InputKind) -> ProbeError {
    ProbeError::MissingPrerequisite { kind: kind.to_string(), input }
}

/// Compiler invocation buckets recognised in a build log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Linker,
    Objects,
    Others,
    All,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Linker => "linker",
            BuildStage::Objects => "objects",
            BuildStage::Others => "others",
            BuildStage::All => "all",
        }
    }
}

/// What a detector asks a parser for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseSelector {
    Stage(BuildStage),
    Variable(String),
}

impl fmt::Display for ParseSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseSelector::Stage(stage) => write!(f, "stage={}", stage.as_str()),
            ParseSelector::Variable(name) => write!(f, "variable={name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutput {
    Lines(Vec<String>),
    Value(String),
}

/// Extracts structured data from one artifact.
///
/// Implementations do their expensive setup on the first `parse` call and
/// cache it behind `&self`; instances are shared by `Rc` inside a single run
/// and are not `Send`.
pub trait Parser {
    fn name(&self) -> &str;
    fn parse(&self, selector: &ParseSelector) -> Result<ParseOutput, ProbeError>;
}

/// Answers queries for the features declared on its spec.
pub trait Detector {
    fn name(&self) -> &str;
    fn detect(&self, feature: &str) -> Result<FeatureValue, ProbeError>;
}
