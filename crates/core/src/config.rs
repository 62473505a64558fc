use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::FeatureId;
use crate::services::detection::ProbeError;
use crate::services::registry::{
    ASLR_DETECTOR, BUILD_LOG_PARSER, HARDENING_DETECTOR, LANG_VERSION_DETECTOR,
    NAMED_CAST_DETECTOR, RULES_VARIABLE_PARSER, SMART_POINTER_DETECTOR,
};

/// Default per-command timeout for external tools.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;

fn default_tool_timeout_secs() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

/// Class names used by older configs, mapped onto kind names.
const LEGACY_KINDS: [(&str, &str); 8] = [
    ("ASLRDetector", ASLR_DETECTOR),
    ("ALSRDetector", ASLR_DETECTOR),
    ("CppVersionDetector", LANG_VERSION_DETECTOR),
    ("HardeningDetector", HARDENING_DETECTOR),
    ("NamedCastDetector", NAMED_CAST_DETECTOR),
    ("SmartPointerDetector", SMART_POINTER_DETECTOR),
    ("BuildLogParser", BUILD_LOG_PARSER),
    ("RulesFlagParser", RULES_VARIABLE_PARSER),
];

fn canonical_kind(kind: &mut String) {
    if let Some((_, name)) = LEGACY_KINDS.iter().find(|(legacy, _)| legacy == kind) {
        *kind = name.to_string();
    }
}

/// A list item, either bare or wrapped in a `detector:` / `parser:` key as
/// older configs write them.
#[derive(Deserialize)]
#[serde(untagged)]
enum Entry<T> {
    Detector { detector: T },
    Parser { parser: T },
    Bare(T),
}

impl<T> Entry<T> {
    fn into_inner(self) -> T {
        match self {
            Entry::Detector { detector } => detector,
            Entry::Parser { parser } => parser,
            Entry::Bare(inner) => inner,
        }
    }
}

fn entries<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let items = Vec::<Entry<T>>::deserialize(deserializer)?;
    Ok(items.into_iter().map(Entry::into_inner).collect())
}

/// Declares a detector: which kind to instantiate, which features it answers,
/// and (optionally) the parser it reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorSpec {
    pub name: String,
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default, alias = "parser_to_use", skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
    #[serde(default, alias = "features_provided")]
    pub features: Vec<FeatureId>,
    /// Kind-specific settings (`tool`, `variable`, `flag`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl DetectorSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            parser: None,
            features: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_parser(mut self, parser: impl Into<String>) -> Self {
        self.parser = Some(parser.into());
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FeatureId>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Declares how to build a parser over one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserSpec {
    pub name: String,
    #[serde(alias = "type")]
    pub kind: String,
    /// Kind-specific construction arguments (`rules_file`, `tool`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ParserSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { name: name.into(), kind: kind.into(), options: BTreeMap::new() }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Serializable probe configuration, typically loaded from a YAML file.
///
/// ```yaml
/// features_selected: [aslr, dynamic_cast]
/// detectors:
///   - name: aslr_detector
///     kind: aslr
///     parser: build_log
///     features: [aslr]
/// parsers:
///   - name: build_log
///     kind: build-log
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Features reported when the caller does not override the selection.
    #[serde(default)]
    pub features_selected: Vec<FeatureId>,
    #[serde(default, deserialize_with = "entries")]
    pub detectors: Vec<DetectorSpec>,
    #[serde(default, deserialize_with = "entries")]
    pub parsers: Vec<ParserSpec>,
    /// Legacy behaviour: let a later detector silently take over a feature
    /// already claimed by an earlier one.
    #[serde(default)]
    pub allow_duplicate_claims: bool,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            features_selected: Vec::new(),
            detectors: Vec::new(),
            parsers: Vec::new(),
            allow_duplicate_claims: false,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
        }
    }
}

impl ProbeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(body: &str) -> Result<Self> {
        let mut config: ProbeConfig =
            serde_yaml::from_str(body).context("Failed to parse probe config YAML")?;
        for detector in &mut config.detectors {
            canonical_kind(&mut detector.kind);
        }
        for parser in &mut config.parsers {
            canonical_kind(&mut parser.kind);
        }
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on the requested feature set.
    pub fn validate(&self) -> Result<(), ProbeError> {
        let mut seen = HashSet::new();
        for detector in &self.detectors {
            if detector.name.trim().is_empty() {
                return Err(ProbeError::InvalidConfig("detector 'name' is required".into()));
            }
            if !seen.insert(detector.name.as_str()) {
                return Err(ProbeError::InvalidConfig(format!(
                    "detector '{}' is declared more than once",
                    detector.name
                )));
            }
        }
        let mut seen = HashSet::new();
        for parser in &self.parsers {
            if parser.name.trim().is_empty() {
                return Err(ProbeError::InvalidConfig("parser 'name' is required".into()));
            }
            if !seen.insert(parser.name.as_str()) {
                return Err(ProbeError::InvalidConfig(format!(
                    "parser '{}' is declared more than once",
                    parser.name
                )));
            }
        }
        if self.tool_timeout_secs == 0 {
            return Err(ProbeError::InvalidConfig("tool_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn detector(&self, name: &str) -> Option<&DetectorSpec> {
        self.detectors.iter().find(|d| d.name == name)
    }

    pub fn parser(&self, name: &str) -> Option<&ParserSpec> {
        self.parsers.iter().find(|p| p.name == name)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// The caller's override when non-empty, otherwise `features_selected`.
    pub fn features_or_default(&self, overrides: &[FeatureId]) -> Vec<FeatureId> {
        if overrides.is_empty() {
            self.features_selected.clone()
        } else {
            overrides.to_vec()
        }
    }
}

/// Load and validate a probe config from disk.
pub fn load_probe_config(path: &Path) -> Result<ProbeConfig> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read probe config at {}", path.display()))?;
    ProbeConfig::from_yaml_str(&body)
        .with_context(|| format!("Invalid probe config at {}", path.display()))
}
