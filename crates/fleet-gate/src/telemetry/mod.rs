//! Logging and metrics for the gate

pub mod log;
pub mod metrics;

pub use log::init_logging;
pub use metrics::GateMetrics;
