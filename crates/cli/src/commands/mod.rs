pub mod bisect;
pub mod detect;
pub mod harness;
pub mod kinds;
pub mod logging;

pub use bisect::*;
pub use detect::*;
pub use harness::*;
pub use kinds::*;
pub use logging::*;
