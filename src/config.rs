//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::Tuning;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-reactor")]
#[command(author = "echo-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to (empty binds every interface)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Capacity of each per-connection buffer in bytes
    #[arg(long)]
    pub buffer_capacity: Option<usize>,

    /// Maximum bytes handed to a single write call
    #[arg(long)]
    pub write_chunk: Option<usize>,

    /// Bytes requested per read call while draining a socket
    #[arg(long)]
    pub read_chunk: Option<usize>,

    /// Maximum readiness events collected per wait
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Upper bound on a single wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

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
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: Option<String>,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: None,
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Event loop tunables
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_write_chunk")]
    pub write_chunk: usize,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            write_chunk: default_write_chunk(),
            read_chunk: default_read_chunk(),
            max_events: default_max_events(),
            poll_timeout_ms: default_poll_timeout_ms(),
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

fn default_port() -> u16 {
    12345
}

fn default_backlog() -> i32 {
    Tuning::default().backlog
}

fn default_buffer_capacity() -> usize {
    Tuning::default().buffer_capacity
}

fn default_write_chunk() -> usize {
    Tuning::default().write_chunk
}

fn default_read_chunk() -> usize {
    Tuning::default().read_chunk
}

fn default_max_events() -> usize {
    Tuning::default().max_events
}

fn default_poll_timeout_ms() -> u64 {
    Tuning::default().poll_timeout.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: Option<String>,
    pub port: u16,
    pub tuning: Tuning,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI args against the config file they may name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let tuning = Tuning {
            backlog: cli.backlog.unwrap_or(file.server.backlog),
            buffer_capacity: cli
                .buffer_capacity
                .unwrap_or(file.runtime.buffer_capacity),
            write_chunk: cli.write_chunk.unwrap_or(file.runtime.write_chunk),
            read_chunk: cli.read_chunk.unwrap_or(file.runtime.read_chunk),
            max_events: cli.max_events.unwrap_or(file.runtime.max_events),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms.unwrap_or(file.runtime.poll_timeout_ms),
            ),
        };

        for (name, value) in [
            ("buffer_capacity", tuning.buffer_capacity),
            ("write_chunk", tuning.write_chunk),
            ("read_chunk", tuning.read_chunk),
            ("max_events", tuning.max_events),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        Ok(Config {
            bind: cli.bind.or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            tuning,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["echo-reactor"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.bind, None);
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.runtime.buffer_capacity, 4096);
        assert_eq!(config.runtime.write_chunk, 8);
        assert_eq!(config.runtime.poll_timeout_ms, 5000);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            bind = "127.0.0.1"
            port = 7000
            backlog = 64

            [runtime]
            buffer_capacity = 1024
            write_chunk = 1

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.bind.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.runtime.buffer_capacity, 1024);
        assert_eq!(config.runtime.write_chunk, 1);
        assert_eq!(config.runtime.read_chunk, 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000
            [runtime]
            write_chunk = 4
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--port", "9000", "--bind", "::1", "--log-level", "trace"]),
            file,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.bind.as_deref(), Some("::1"));
        assert_eq!(config.tuning.write_chunk, 4);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_zero_write_chunk_rejected() {
        let result = Config::merge(cli(&["--write-chunk", "0"]), TomlConfig::default());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::from_cli(cli(&["--config", "/nonexistent/echo.toml"]));
        assert!(matches!(result, Err(ConfigError::FileRead(_, _))));
    }
}
