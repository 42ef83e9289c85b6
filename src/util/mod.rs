//! Small shared helpers: clocks, identifiers, log formatting and tracing setup.

pub mod clock;
pub mod ids;
pub mod logfmt;
pub mod telemetry;

pub use clock::*;
pub use ids::*;
pub use logfmt::*;
pub use telemetry::*;
