//! Detection services: capability interfaces, built-in kinds, resolution,
//! execution, bisection, and the batch harness.

pub mod bisect;
pub mod detection;
pub mod detectors;
pub mod git;
pub mod harness;
pub mod parsers;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod tool;

pub use detection::{DetectionInputs, Detector, Parser, ProbeError};
pub use registry::{default_kind_registry, KindRegistry};
pub use runner::{PreparedRun, Runner};
