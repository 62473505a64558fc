use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{DetectorSpec, ParserSpec, ProbeConfig};
use crate::services::detection::{DetectionInputs, Detector, Parser, ProbeError};
use crate::services::detectors::source_pattern::{
    pattern_table, NAMED_CAST_PATTERNS, SMART_POINTER_PATTERNS,
};
use crate::services::detectors::{
    AslrDetector, HardeningDetector, LangVersionDetector, RulesFlagDetector, SourcePatternDetector,
};
use crate::services::parsers::rules::DEFAULT_RULES_FILE;
use crate::services::parsers::{BuildLogParser, RulesVariableParser};
use crate::services::tool::resolve_tool;

pub const BUILD_LOG_PARSER: &str = "build-log";
pub const RULES_VARIABLE_PARSER: &str = "rules-variable";

pub const ASLR_DETECTOR: &str = "aslr";
pub const LANG_VERSION_DETECTOR: &str = "lang-version";
pub const HARDENING_DETECTOR: &str = "hardening-check";
pub const NAMED_CAST_DETECTOR: &str = "named-cast";
pub const SMART_POINTER_DETECTOR: &str = "smart-pointer";
pub const RULES_FLAG_DETECTOR: &str = "rules-flag";

/// Everything a parser factory gets to work with.
pub struct ParserBuild<'a> {
    pub spec: &'a ParserSpec,
    pub inputs: &'a DetectionInputs,
    pub timeout: Duration,
}

/// Everything a detector factory gets to work with. `parser` is the shared
/// instance named by `spec.parser`, already built.
pub struct DetectorBuild<'a> {
    pub spec: &'a DetectorSpec,
    pub inputs: &'a DetectionInputs,
    pub parser: Option<Rc<dyn Parser>>,
    pub timeout: Duration,
}

impl DetectorBuild<'_> {
    pub fn require_parser(&self) -> Result<Rc<dyn Parser>, ProbeError> {
        self.parser.clone().ok_or_else(|| ProbeError::UnresolvedParserReference {
            detector: self.spec.name.clone(),
            parser: "<none declared>".to_string(),
        })
    }

    pub fn require_option(&self, key: &str) -> Result<&str, ProbeError> {
        self.spec.option(key).ok_or_else(|| {
            ProbeError::InvalidConfig(format!(
                "detector '{}' of kind '{}' needs option '{key}'",
                self.spec.name, self.spec.kind
            ))
        })
    }
}

pub type ParserFactory = Box<dyn Fn(&ParserBuild<'_>) -> Result<Rc<dyn Parser>, ProbeError>>;
pub type DetectorFactory = Box<dyn Fn(&DetectorBuild<'_>) -> Result<Box<dyn Detector>, ProbeError>>;

/// Kind name -> factory, for detectors and parsers. New kinds plug in here
/// without touching the resolver or the runner.
#[derive(Default)]
pub struct KindRegistry {
    detectors: HashMap<String, DetectorFactory>,
    parsers: HashMap<String, ParserFactory>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_detector<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&DetectorBuild<'_>) -> Result<Box<dyn Detector>, ProbeError> + 'static,
    {
        self.detectors.insert(kind.to_string(), Box::new(factory));
        self
    }

    pub fn register_parser<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&ParserBuild<'_>) -> Result<Rc<dyn Parser>, ProbeError> + 'static,
    {
        self.parsers.insert(kind.to_string(), Box::new(factory));
        self
    }

    pub fn has_detector(&self, kind: &str) -> bool {
        self.detectors.contains_key(kind)
    }

    /// Sorted detector kind names for help output and error messages.
    pub fn detector_kinds(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.detectors.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn parser_kinds(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.parsers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Per-run construction state: builds detectors on demand and keeps every
/// parser it builds, keyed by declared name, for reuse within the run.
pub struct InstanceBuilder<'a> {
    kinds: &'a KindRegistry,
    config: &'a ProbeConfig,
    inputs: &'a DetectionInputs,
    parsers: HashMap<String, Rc<dyn Parser>>,
    constructed: Vec<String>,
}

impl<'a> InstanceBuilder<'a> {
    pub fn new(
        kinds: &'a KindRegistry,
        config: &'a ProbeConfig,
        inputs: &'a DetectionInputs,
    ) -> Self {
        Self { kinds, config, inputs, parsers: HashMap::new(), constructed: Vec::new() }
    }

    /// Parser names in the order they were constructed. Each name appears once.
    pub fn constructed_parsers(&self) -> &[String] {
        &self.constructed
    }

    /// Return the shared parser called `name`, building it on first reference.
    pub fn parser(&mut self, detector: &str, name: &str) -> Result<Rc<dyn Parser>, ProbeError> {
        if let Some(parser) = self.parsers.get(name) {
            debug!(parser = name, detector, "reusing parser");
            return Ok(Rc::clone(parser));
        }
        let (kinds, config) = (self.kinds, self.config);
        let spec = config.parser(name).ok_or_else(|| {
            ProbeError::UnresolvedParserReference {
                detector: detector.to_string(),
                parser: name.to_string(),
            }
        })?;
        let factory = kinds
            .parsers
            .get(&spec.kind)
            .ok_or_else(|| ProbeError::UnknownParserKind(spec.kind.clone()))?;
        let parser =
            factory(&ParserBuild { spec, inputs: self.inputs, timeout: config.tool_timeout() })?;
        info!(parser = name, kind = %spec.kind, detector, "constructed parser");
        self.constructed.push(name.to_string());
        self.parsers.insert(name.to_string(), Rc::clone(&parser));
        Ok(parser)
    }

    /// Build a detector instance for `spec`, constructing its parser if needed.
    pub fn detector(&mut self, spec: &DetectorSpec) -> Result<Box<dyn Detector>, ProbeError> {
        let kinds = self.kinds;
        if !kinds.has_detector(&spec.kind) {
            return Err(ProbeError::UnknownDetectorKind(spec.kind.clone()));
        }
        let parser = match &spec.parser {
            Some(name) => Some(self.parser(&spec.name, name)?),
            None => None,
        };
        let factory = &kinds.detectors[&spec.kind];
        let detector = factory(&DetectorBuild {
            spec,
            inputs: self.inputs,
            parser,
            timeout: self.config.tool_timeout(),
        })?;
        info!(detector = %spec.name, kind = %spec.kind, "constructed detector");
        Ok(detector)
    }
}

/// Registry populated with every built-in detector and parser kind.
pub fn default_kind_registry() -> KindRegistry {
    let mut registry = KindRegistry::new();

    registry.register_parser(BUILD_LOG_PARSER, |build| {
        let log = build.inputs.require_build_log(BUILD_LOG_PARSER)?;
        Ok(Rc::new(BuildLogParser::new(
            &build.spec.name,
            log.to_path_buf(),
            build.inputs.binary_name.clone(),
        )))
    });
    registry.register_parser(RULES_VARIABLE_PARSER, |build| {
        let source = build.inputs.require_source_dir(RULES_VARIABLE_PARSER)?;
        let rules = build.spec.option("rules_file").unwrap_or(DEFAULT_RULES_FILE);
        let make = resolve_tool(build.spec.option("tool"), "MAKE_BIN", "make");
        Ok(Rc::new(RulesVariableParser::new(
            &build.spec.name,
            source.to_path_buf(),
            source.join(rules),
            make,
            build.timeout,
        )))
    });

    registry.register_detector(ASLR_DETECTOR, |build| {
        Ok(Box::new(AslrDetector::new(&build.spec.name, build.require_parser()?)))
    });
    registry.register_detector(LANG_VERSION_DETECTOR, |build| {
        Ok(Box::new(LangVersionDetector::new(&build.spec.name, build.require_parser()?)))
    });
    registry.register_detector(HARDENING_DETECTOR, |build| {
        let binary = build.inputs.require_binary_path(HARDENING_DETECTOR)?;
        let tool =
            resolve_tool(build.spec.option("tool"), "HARDENING_CHECK_BIN", "hardening-check");
        Ok(Box::new(HardeningDetector::new(
            &build.spec.name,
            binary.to_path_buf(),
            tool,
            build.timeout,
        )))
    });
    registry.register_detector(NAMED_CAST_DETECTOR, |build| {
        source_pattern_detector(build, NAMED_CAST_DETECTOR, &NAMED_CAST_PATTERNS)
    });
    registry.register_detector(SMART_POINTER_DETECTOR, |build| {
        source_pattern_detector(build, SMART_POINTER_DETECTOR, &SMART_POINTER_PATTERNS)
    });
    registry.register_detector(RULES_FLAG_DETECTOR, |build| {
        let parser = build.require_parser()?;
        let variable = build.require_option("variable")?;
        let flag = build.require_option("flag")?;
        Ok(Box::new(RulesFlagDetector::new(&build.spec.name, parser, variable, flag)))
    });

    registry
}

/// Shared factory for grep-backed kinds. `pattern.<feature>` options add or
/// override entries in the built-in table; `include` is a comma-separated glob list.
fn source_pattern_detector(
    build: &DetectorBuild<'_>,
    kind: &str,
    defaults: &[(&str, &str)],
) -> Result<Box<dyn Detector>, ProbeError> {
    let source = build.inputs.require_source_dir(kind)?;
    let mut patterns = pattern_table(defaults);
    for (key, value) in &build.spec.options {
        if let Some(feature) = key.strip_prefix("pattern.") {
            patterns.insert(feature.to_string(), value.clone());
        }
    }
    let includes = build
        .spec
        .option("include")
        .map(|list| {
            list.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
        })
        .unwrap_or_default();
    let grep = resolve_tool(build.spec.option("tool"), "GREP_BIN", "grep");
    let detector = SourcePatternDetector::new(
        &build.spec.name,
        source.to_path_buf(),
        patterns,
        grep,
        build.timeout,
    )
    .with_includes(includes);
    Ok(Box::new(detector))
}
