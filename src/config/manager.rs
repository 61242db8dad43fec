//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Log levels accepted by `monitoring.log_level`
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Values given on the command line. `None` leaves the lower-priority source in place.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_ip: Option<std::net::IpAddr>,
    pub listen_port: Option<u16>,
    pub pool_host: Option<String>,
    pub pool_port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub buffer_size: Option<usize>,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub log_level: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
}

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a TOML file. Not validated here: the pool
    /// endpoint usually arrives later from the command line.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load defaults overridden by `STRATUM_RELAY_*` environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_vars(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_vars<F>(config: &mut Config, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = var("STRATUM_RELAY_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid STRATUM_RELAY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(host) = var("STRATUM_RELAY_POOL_HOST") {
            config.pool.host = host;
        }

        if let Some(port) = var("STRATUM_RELAY_POOL_PORT") {
            config.pool.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid STRATUM_RELAY_POOL_PORT: {}", port))?;
        }

        if let Some(buffer_size) = var("STRATUM_RELAY_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid STRATUM_RELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(timeout) = var("STRATUM_RELAY_CONNECT_TIMEOUT") {
            config.server.connect_timeout = Some(
                humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid STRATUM_RELAY_CONNECT_TIMEOUT: {}", timeout))?,
            );
        }

        if let Some(timeout) = var("STRATUM_RELAY_IDLE_TIMEOUT") {
            config.server.idle_timeout = Some(
                humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid STRATUM_RELAY_IDLE_TIMEOUT: {}", timeout))?,
            );
        }

        if let Some(log_level) = var("STRATUM_RELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .context("Server configuration validation failed")?;

        self.validate_pool_config()
            .context("Pool configuration validation failed")?;

        self.validate_monitoring_config()
            .context("Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.buffer_size < 512 {
            bail!("buffer_size must be at least 512 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.connect_timeout.is_some_and(|t| t.is_zero()) {
            bail!("connect_timeout must be greater than 0 when set");
        }

        if self.server.idle_timeout.is_some_and(|t| t.is_zero()) {
            bail!("idle_timeout must be greater than 0 when set");
        }

        Ok(())
    }

    fn validate_pool_config(&self) -> Result<()> {
        if self.pool.host.trim().is_empty() {
            bail!("pool host must be set (--pool-host)");
        }

        if self.pool.port == 0 {
            bail!("pool port must be set (--pool-port)");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) {
        if let Some(ip) = cli.bind_ip {
            self.server.bind_addr.set_ip(ip);
            tracing::info!("CLI override: bind address set to {}", ip);
        }

        if let Some(port) = cli.listen_port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: listen port set to {}", port);
        }

        if let Some(host) = &cli.pool_host {
            self.pool.host = host.clone();
        }

        if let Some(port) = cli.pool_port {
            self.pool.port = port;
        }

        if cli.user.is_some() {
            self.pool.user = cli.user.clone();
        }

        if cli.password.is_some() {
            self.pool.password = cli.password.clone();
        }

        if let Some(buffer_size) = cli.buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(timeout) = cli.connect_timeout {
            self.server.connect_timeout = Some(timeout);
            tracing::info!("CLI override: connect timeout set to {:?}", timeout);
        }

        if let Some(timeout) = cli.idle_timeout {
            self.server.idle_timeout = Some(timeout);
            tracing::info!("CLI override: idle timeout set to {:?}", timeout);
        }

        if let Some(level) = &cli.log_level {
            self.monitoring.log_level = level.clone();
        }

        if let Some(addr) = cli.metrics_addr {
            self.monitoring.metrics_addr = Some(addr);
            tracing::info!("CLI override: metrics endpoint set to {}", addr);
        }
    }
}
