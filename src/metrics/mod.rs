//! Metrics Module
//!
//! Handles metrics collection and export.

pub mod collector;
pub mod server;
pub mod types;

pub use collector::Metrics;
pub use server::MetricsServer;
pub use types::MetricsSnapshot;
