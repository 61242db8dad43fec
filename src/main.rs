//! Stratum Relay - transparent miner-to-pool TCP relay

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratum_relay::{
    config::{CliOverrides, ConfigManager},
    metrics::{Metrics, MetricsServer},
    ConnectionManager, ShutdownCoordinator,
};

/// CLI arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "stratum-relay")]
#[command(about = "Transparent TCP relay between Stratum miners and a mining pool")]
#[command(version)]
#[command(long_about = "
Stratum Relay - transparent TCP relay between Stratum miners and a mining pool

Miners connect to the relay as if it were the pool. Every connection gets its
own connection to the pool, and bytes are forwarded unmodified both ways.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file (--config)
3. Environment variables (read only when no configuration file is given)
4. Built-in defaults

--pool-host, --pool-port, --user and --passw are required, so they always
replace the [pool] section of a configuration file.

Environment variables:
  STRATUM_RELAY_BIND_ADDR        - Listen address (e.g., 0.0.0.0:3333)
  STRATUM_RELAY_BUFFER_SIZE      - Per-direction buffer size in bytes
  STRATUM_RELAY_CONNECT_TIMEOUT  - Pool connect timeout (e.g., 10s)
  STRATUM_RELAY_IDLE_TIMEOUT     - Close sessions silent for this long (e.g., 10m)
  STRATUM_RELAY_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Port on which the relay accepts miner connections [default: 3333]
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Hostname or IP of the mining pool
    #[arg(long)]
    pub pool_host: String,

    /// TCP port of the mining pool
    #[arg(long)]
    pub pool_port: u16,

    /// Pool username. Accepted for compatibility, not used by the relay
    #[arg(long)]
    pub user: String,

    /// Pool password. Accepted for compatibility, not used by the relay
    #[arg(long)]
    pub passw: String,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(short, long)]
    pub bind: Option<IpAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Buffer size in bytes for each forwarding direction
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Timeout for connecting to the pool (e.g., 10s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub connect_timeout: Option<Duration>,

    /// Close a direction that has been silent this long (e.g., 10m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Serve Prometheus metrics on this address (e.g., 127.0.0.1:9100)
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind_ip: self.bind,
            listen_port: self.listen_port,
            pool_host: Some(self.pool_host.clone()),
            pool_port: Some(self.pool_port),
            user: Some(self.user.clone()),
            password: Some(self.passw.clone()),
            buffer_size: self.buffer_size,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            log_level: self.verbose.then(|| "debug".to_string()).or_else(|| self.log_level.clone()),
            metrics_addr: self.metrics_addr,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // CLI args > config file > environment > defaults
    let mut config = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => ConfigManager::load_from_env()?,
    };
    config.merge_with_cli_args(&args.overrides());

    init_tracing(&config.monitoring.log_level)?;

    if let Some(path) = &args.config {
        info!("Configuration loaded from {}", path.display());
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen address: {}", config.server.bind_addr);
        info!("  Pool: {}", config.pool.target());
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        info!("  Connect timeout: {:?}", config.server.connect_timeout);
        info!("  Idle timeout: {:?}", config.server.idle_timeout);
        info!("  Metrics endpoint: {:?}", config.monitoring.metrics_addr);
        return Ok(());
    }

    info!(
        "Starting stratum-relay v{}: {} -> {}",
        env!("CARGO_PKG_VERSION"),
        config.server.bind_addr,
        config.pool.target()
    );

    if config.pool.has_credentials() {
        info!("Pool credentials accepted but not forwarded; miners authorize with the pool directly");
    }

    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new()?);
    let shutdown = ShutdownCoordinator::new();

    // A bind failure ends the process with a non-zero status
    let manager = ConnectionManager::bind(Arc::clone(&config), Arc::clone(&metrics))
        .await
        .context("Cannot start relay")?;

    let metrics_handle = match config.monitoring.metrics_addr {
        Some(addr) => {
            let server = MetricsServer::bind(addr, Arc::clone(&metrics))
                .await
                .with_context(|| format!("Cannot start metrics server on {}", addr))?;
            Some(tokio::spawn(server.run(shutdown.subscribe())))
        }
        None => None,
    };

    info!("Proxy running at {}", manager.local_addr());

    let mut server_handle = tokio::spawn(manager.run(shutdown.subscribe()));

    tokio::select! {
        result = &mut server_handle => {
            // The listener only returns on its own when accepting fails for good
            shutdown.trigger();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("Relay listener stopped"),
                Err(e) => Err(e).context("Relay listener task failed"),
            };
        }
        signal_result = shutdown.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
                shutdown.trigger();
            }
        }
    }

    info!("Initiating graceful shutdown...");

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Relay listener error during shutdown: {}", e),
        Err(e) => warn!("Relay listener task failed: {}", e),
    }

    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            warn!("Metrics server task failed: {}", e);
        }
    }

    info!("Relay shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REQUIRED: [&str; 9] = [
        "stratum-relay",
        "--pool-host",
        "pool.example.com",
        "--pool-port",
        "3333",
        "--user",
        "rig01",
        "--passw",
        "x",
    ];

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_listen_port_survives_cli_merge() {
        let file = config_file("[server]\nbind_addr = \"0.0.0.0:4444\"\n");
        let mut config = ConfigManager::load_from_file(file.path()).unwrap();

        let args = CliArgs::parse_from(REQUIRED);
        assert_eq!(args.listen_port, None);
        config.merge_with_cli_args(&args.overrides());

        assert_eq!(config.server.bind_addr.port(), 4444);
        assert_eq!(config.pool.target(), "pool.example.com:3333");
    }

    #[test]
    fn test_explicit_listen_port_wins_over_file() {
        let file = config_file("[server]\nbind_addr = \"0.0.0.0:4444\"\n");
        let mut config = ConfigManager::load_from_file(file.path()).unwrap();

        let args = CliArgs::parse_from(REQUIRED.iter().copied().chain(["--listen-port", "5555"]));
        config.merge_with_cli_args(&args.overrides());

        assert_eq!(config.server.bind_addr.port(), 5555);
    }

    #[test]
    fn test_listen_port_defaults_to_3333() {
        let mut config = stratum_relay::Config::default();
        config.merge_with_cli_args(&CliArgs::parse_from(REQUIRED).overrides());

        assert_eq!(config.server.bind_addr.port(), 3333);
        assert!(config.server.bind_addr.ip().is_unspecified());
    }

    #[test]
    fn test_pool_endpoint_is_required() {
        let missing_pool = REQUIRED.iter().copied().take(1).chain(["--user", "rig01", "--passw", "x"]);
        assert!(CliArgs::try_parse_from(missing_pool).is_err());
    }
}
