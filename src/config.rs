//! Configuration module for the coverage collector.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::frame::DEFAULT_BUFFER_SIZE;

/// Command-line arguments for the collector
#[derive(Parser, Debug)]
#[command(name = "coverage-collector")]
#[command(author = "coverage-collector authors")]
#[command(version = "0.1.0")]
#[command(about = "Collects method coverage streamed by instrumented devices", long_about = None)]
pub struct CliArgs {
    /// Output directory holding one subdirectory per application
    pub out_dir: Option<PathBuf>,

    /// TCP port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (loopback unless overridden)
    #[arg(long)]
    pub host: Option<String>,

    /// Idle time in milliseconds after which a connection is reaped
    #[arg(short = 'i', long)]
    pub idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub connections: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Output location
#[derive(Debug, Deserialize, Default)]
pub struct OutputConfig {
    pub dir: Option<PathBuf>,
}

/// Per-connection lifecycle settings
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Idle time before a connection is reaped
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Interval between reaper sweeps
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// Longest a single read waits before the stop flag is rechecked
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Initial reassembly buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Grace period between stopping workers and closing the listener
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            buffer_size: default_buffer_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    12345
}

fn default_idle_timeout_ms() -> u64 {
    5000
}

fn default_reap_interval_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub out_dir: PathBuf,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub read_timeout: Duration,
    pub buffer_size: usize,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let out_dir = cli
            .out_dir
            .or(toml_config.output.dir)
            .ok_or(ConfigError::MissingOutputDir)?;
        let connections = toml_config.connections;

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            out_dir,
            idle_timeout: Duration::from_millis(
                cli.idle_timeout_ms.unwrap_or(connections.idle_timeout_ms),
            ),
            reap_interval: Duration::from_millis(connections.reap_interval_ms.max(1)),
            read_timeout: Duration::from_millis(connections.read_timeout_ms.max(1)),
            buffer_size: connections.buffer_size,
            shutdown_grace: Duration::from_millis(connections.shutdown_grace_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Configuration with defaults for everything but the output directory.
    pub fn with_out_dir(out_dir: impl Into<PathBuf>) -> Self {
        let connections = ConnectionConfig::default();
        let server = ServerConfig::default();
        Config {
            host: server.host,
            port: server.port,
            out_dir: out_dir.into(),
            idle_timeout: Duration::from_millis(connections.idle_timeout_ms),
            reap_interval: Duration::from_millis(connections.reap_interval_ms),
            read_timeout: Duration::from_millis(connections.read_timeout_ms),
            buffer_size: connections.buffer_size,
            shutdown_grace: Duration::from_millis(connections.shutdown_grace_ms),
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingOutputDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingOutputDir => {
                write!(f, "No output directory given on the command line or in the config file")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.connections.idle_timeout_ms, 5000);
        assert_eq!(config.connections.reap_interval_ms, 5000);
        assert_eq!(config.connections.buffer_size, 100 * 1024);
        assert!(config.output.dir.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 7100

            [output]
            dir = "/var/lib/coverage"

            [connections]
            idle_timeout_ms = 30000
            shutdown_grace_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7100);
        assert_eq!(config.output.dir, Some(PathBuf::from("/var/lib/coverage")));
        assert_eq!(config.connections.idle_timeout_ms, 30000);
        assert_eq!(config.connections.read_timeout_ms, 1000);
        assert_eq!(config.connections.shutdown_grace_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_positional_args_override_file() {
        let cli = CliArgs::parse_from(["coverage-collector", "/tmp/out", "9100", "-i", "750"]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7100
            [output]
            dir = "/elsewhere"
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.out_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.idle_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_missing_output_dir() {
        let cli = CliArgs::parse_from(["coverage-collector"]);
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::MissingOutputDir)
        ));
    }
}
