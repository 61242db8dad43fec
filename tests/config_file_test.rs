//! Configuration file loading

use std::io::Write;
use std::time::Duration;

use stratum_relay::config::{CliOverrides, ConfigManager, DEFAULT_BUFFER_SIZE};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_full_config_file() {
    let file = write_config(
        r#"
[server]
bind_addr = "127.0.0.1:13333"
buffer_size = 8192
connect_timeout = "5s"
idle_timeout = "10m"
shutdown_timeout = "3s"
tcp_nodelay = false

[pool]
host = "stratum.example.net"
port = 4444
user = "rig01"
password = "x"

[monitoring]
log_level = "debug"
metrics_addr = "127.0.0.1:9100"
"#,
    );

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.server.bind_addr.port(), 13333);
    assert_eq!(config.server.buffer_size, 8192);
    assert_eq!(config.server.connect_timeout, Some(Duration::from_secs(5)));
    assert_eq!(config.server.idle_timeout, Some(Duration::from_secs(600)));
    assert_eq!(config.server.shutdown_timeout, Duration::from_secs(3));
    assert!(!config.server.tcp_nodelay);
    assert_eq!(config.pool.target(), "stratum.example.net:4444");
    assert!(config.pool.has_credentials());
    assert_eq!(config.monitoring.log_level, "debug");
    assert!(config.monitoring.metrics_addr.is_some());

    // the password never shows up in debug output
    let debug = format!("{:?}", config);
    assert!(debug.contains("<redacted>"));
    assert!(!debug.contains("\"x\""));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let file = write_config(
        r#"
[pool]
host = "10.0.0.5"
port = 3333
"#,
    );

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.server.bind_addr.port(), 3333);
    assert_eq!(config.server.buffer_size, DEFAULT_BUFFER_SIZE);
    assert_eq!(config.server.connect_timeout, None);
    assert_eq!(config.server.idle_timeout, None);
    assert_eq!(config.monitoring.log_level, "info");
}

#[test]
fn test_cli_wins_over_file() {
    let file = write_config(
        r#"
[server]
bind_addr = "0.0.0.0:3333"

[pool]
host = "file.pool"
port = 3333
"#,
    );

    let mut config = ConfigManager::load_from_file(file.path()).unwrap();
    config.merge_with_cli_args(&CliOverrides {
        listen_port: Some(4000),
        pool_port: Some(5555),
        ..CliOverrides::default()
    });

    assert_eq!(config.server.bind_addr.port(), 4000);
    assert_eq!(config.pool.target(), "file.pool:5555");
}

#[test]
fn test_malformed_file_is_rejected() {
    let file = write_config("[server]\nbuffer_size = \"lots\"\n");

    let err = ConfigManager::load_from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_missing_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = ConfigManager::load_from_file(&path).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
