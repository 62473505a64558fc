//! probe-core
//!
//! Core library for detecting hardening and coding-practice features in
//! packages, and for locating the commit that introduced a feature.
//!
//! This crate defines the result model, the probe configuration, the
//! detector/parser capability interfaces and their built-in kinds, the
//! feature resolver and runner, the bisection engine, and the batch harness.
//!
//! The goal is to keep all substantive logic here so it is fully testable and
//! reusable from multiple frontends.

pub mod config;
pub mod model;
pub mod services;
pub mod workspace;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
