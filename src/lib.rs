//! Stratum Relay Library
//!
//! Transparent TCP relay between Stratum mining clients and a single mining
//! pool. Bytes are forwarded untouched in both directions; the relay never
//! looks inside the Stratum JSON-RPC stream.

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use connection::ConnectionManager;
pub use error::{RelayError, RelayResult};
pub use metrics::Metrics;
pub use relay::RelayEngine;
pub use shutdown::ShutdownCoordinator;

/// Common error type for application-level operations
pub type Result<T> = anyhow::Result<T>;
