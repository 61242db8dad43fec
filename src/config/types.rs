//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Default port miners connect to
pub const DEFAULT_LISTEN_PORT: u16 = 3333;

/// Default size of the per-direction read buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub monitoring: MonitoringConfig,
}

/// Listener and session tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub buffer_size: usize,
    /// Bound on the single upstream connect attempt. `None` leaves it to the OS.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    /// Per-read inactivity deadline. `None` keeps silent miners connected forever.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub tcp_nodelay: bool,
}

/// Upstream pool endpoint
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    /// Accepted for compatibility with rental front-ends. Never sent upstream:
    /// the miner's own `mining.authorize` is what reaches the pool.
    pub user: Option<String>,
    /// Same status as `user`.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

/// Logging and metrics
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub metrics_addr: Option<SocketAddr>,
}

impl PoolConfig {
    /// `host:port` form used for resolution and log output
    pub fn target(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.user.is_some() || self.password.is_some()
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: None,
            idle_timeout: None,
            shutdown_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
        }
    }
}
