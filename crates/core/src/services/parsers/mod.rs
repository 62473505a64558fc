//! Built-in parser kinds.

pub mod build_log;
pub mod rules;

pub use build_log::{BuildLogParser, CompilerLines};
pub use rules::RulesVariableParser;
