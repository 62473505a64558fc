//! On-disk scratch space used by the batch harness.
//!
//! Each package gets fresh source, binary, build-log, and git directories
//! under one root; they are recreated before the package and removed after.

pub mod layout;

pub use layout::ScratchLayout;
