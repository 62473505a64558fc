use std::rc::Rc;

use tracing::debug;

use crate::model::FeatureValue;
use crate::services::detection::{Detector, ParseOutput, ParseSelector, Parser, ProbeError};

/// Checks whether a rules-file variable (e.g. `CXXFLAGS`) carries a flag.
pub struct RulesFlagDetector {
    name: String,
    parser: Rc<dyn Parser>,
    variable: String,
    flag: String,
}

impl RulesFlagDetector {
    pub fn new(
        name: impl Into<String>,
        parser: Rc<dyn Parser>,
        variable: impl Into<String>,
        flag: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), parser, variable: variable.into(), flag: flag.into() }
    }
}

impl Detector for RulesFlagDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, feature: &str) -> Result<FeatureValue, ProbeError> {
        let output = self.parser.parse(&ParseSelector::Variable(self.variable.clone()))?;
        let ParseOutput::Value(line) = output else {
            return Err(ProbeError::UnsupportedSelector {
                parser: self.parser.name().to_string(),
                selector: format!("variable={}", self.variable),
            });
        };
        let present = line
            .split_once('=')
            .map(|(_, value)| value)
            .unwrap_or_default()
            .split_whitespace()
            .any(|token| token == self.flag);
        debug!(detector = %self.name, feature, variable = %self.variable, present, "ran detector");
        Ok(FeatureValue::Bool(present))
    }
}
