//! Driver facade: the orchestrator's block-device contract

pub mod errors;
pub mod facade;
pub mod metrics;

pub use errors::{DriverError, DriverErrorKind, DriverResult, Operation};
pub use facade::{local_hostname, BlockDeviceDriver};
pub use metrics::DriverMetrics;
