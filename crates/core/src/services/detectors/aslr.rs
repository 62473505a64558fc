use std::rc::Rc;

use tracing::{debug, warn};

use crate::model::FeatureValue;
use crate::services::detection::{BuildStage, Detector, ParseSelector, Parser, ProbeError};
use crate::services::detectors::expect_lines;

/// Flags that mark a position-independent executable at link time.
const PIE_FLAGS: [&str; 2] = ["-fPIE", "-pie"];

/// Checks the binary's link line for position-independent-executable flags.
pub struct AslrDetector {
    name: String,
    parser: Rc<dyn Parser>,
}

impl AslrDetector {
    pub fn new(name: impl Into<String>, parser: Rc<dyn Parser>) -> Self {
        Self { name: name.into(), parser }
    }
}

/// True when a link line carries `-fPIE` or `-pie`.
pub fn has_pie_flag(line: &str) -> bool {
    PIE_FLAGS.iter().any(|flag| line.contains(flag))
}

impl Detector for AslrDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, feature: &str) -> Result<FeatureValue, ProbeError> {
        let output = self.parser.parse(&ParseSelector::Stage(BuildStage::Linker))?;
        let lines = expect_lines(self.parser.name(), output)?;
        let detected = match lines.first() {
            Some(line) => has_pie_flag(line),
            None => {
                warn!(detector = %self.name, "no linking line found in build log");
                false
            }
        };
        debug!(detector = %self.name, feature, detected, "ran detector");
        Ok(FeatureValue::Bool(detected))
    }
}
