//! Built-in detector kinds.

pub mod aslr;
pub mod hardening;
pub mod lang_version;
pub mod rules_flag;
pub mod source_pattern;

pub use aslr::AslrDetector;
pub use hardening::HardeningDetector;
pub use lang_version::LangVersionDetector;
pub use rules_flag::RulesFlagDetector;
pub use source_pattern::SourcePatternDetector;

use crate::services::detection::{ParseOutput, ProbeError};

/// Unwrap line-oriented parser output.
pub(crate) fn expect_lines(parser: &str, output: ParseOutput) -> Result<Vec<String>, ProbeError> {
    match output {
        ParseOutput::Lines(lines) => Ok(lines),
        ParseOutput::Value(_) => Err(ProbeError::UnsupportedSelector {
            parser: parser.to_string(),
            selector: "stage (parser returned a single value)".to_string(),
        }),
    }
}
