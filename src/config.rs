//! Configuration module for linewire.
//!
//! The library side is [`ServerConfig`], a set of optional listener
//! settings that resolves exactly once into an immutable [`ListenConfig`]
//! before the listener binds. The demo binary additionally loads a
//! [`Config`] from command-line arguments and an optional TOML file;
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 3333;

/// Longest accepted request line, excluding the newline.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Listen backlog passed to the socket.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Stream transport the listener binds with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP over whichever address family the host resolves to first.
    #[default]
    Tcp,
    /// TCP restricted to IPv4 addresses.
    Tcp4,
    /// TCP restricted to IPv6 addresses.
    Tcp6,
}

impl TransportKind {
    /// Whether `addr` belongs to the address family this transport allows.
    pub fn accepts(self, addr: &std::net::SocketAddr) -> bool {
        match self {
            TransportKind::Tcp => true,
            TransportKind::Tcp4 => addr.is_ipv4(),
            TransportKind::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Tcp4 => write!(f, "tcp4"),
            TransportKind::Tcp6 => write!(f, "tcp6"),
        }
    }
}

/// Listener settings supplied by the host. Unset fields fall back to
/// the built-in defaults when the server resolves them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Host name or address to bind to
    pub host: Option<String>,
    /// Port to bind to
    pub port: Option<u16>,
    /// Transport kind (tcp, tcp4, tcp6)
    pub transport: Option<TransportKind>,
    /// Longest accepted request line in bytes
    pub max_line_length: Option<usize>,
    /// Listen backlog
    pub backlog: Option<u32>,
}

impl ServerConfig {
    /// Fill every unset field with its default.
    ///
    /// This is the only place defaults are applied; the result is fixed
    /// for the lifetime of the server.
    pub fn resolve(&self) -> ListenConfig {
        ListenConfig {
            host: self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            transport: self.transport.unwrap_or_default(),
            max_line_length: self.max_line_length.unwrap_or(DEFAULT_MAX_LINE_LENGTH),
            backlog: self.backlog.unwrap_or(DEFAULT_BACKLOG),
        }
    }
}

/// Effective listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub max_line_length: usize,
    pub backlog: u32,
}

impl ListenConfig {
    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[command(name = "linewire")]
#[command(author = "linewire authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-delimited JSON request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 127.0.0.1)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Transport kind
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Longest accepted request line in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Seconds between heartbeat broadcasts (0 = disabled)
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

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
    pub demo: DemoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Demo host configuration
#[derive(Debug, Deserialize, Default)]
pub struct DemoConfig {
    /// Seconds between heartbeat broadcasts
    #[serde(default)]
    pub heartbeat_interval: u64,
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Final configuration of the demo binary
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub heartbeat_interval: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let file = toml_config.server;
        Config {
            server: ServerConfig {
                host: cli.host.or(file.host),
                port: cli.port.or(file.port),
                transport: cli.transport.or(file.transport),
                max_line_length: cli.max_line_length.or(file.max_line_length),
                backlog: file.backlog,
            },
            heartbeat_interval: cli
                .heartbeat_interval
                .unwrap_or(toml_config.demo.heartbeat_interval),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let resolved = ServerConfig::default().resolve();
        assert_eq!(resolved.host, "localhost");
        assert_eq!(resolved.port, 3333);
        assert_eq!(resolved.transport, TransportKind::Tcp);
        assert_eq!(resolved.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert_eq!(resolved.backlog, DEFAULT_BACKLOG);
        assert_eq!(resolved.address(), "localhost:3333");
    }

    #[test]
    fn test_resolve_keeps_explicit_values() {
        let config = ServerConfig {
            host: Some("::1".to_string()),
            port: Some(9000),
            transport: Some(TransportKind::Tcp6),
            max_line_length: Some(64),
            backlog: Some(16),
        };
        let resolved = config.resolve();
        assert_eq!(resolved.port, 9000);
        assert_eq!(resolved.transport, TransportKind::Tcp6);
        assert_eq!(resolved.max_line_length, 64);
        assert_eq!(resolved.address(), "[::1]:9000");
    }

    #[test]
    fn test_transport_accepts_family() {
        let v4: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: std::net::SocketAddr = "[::1]:1".parse().unwrap();
        assert!(TransportKind::Tcp.accepts(&v4));
        assert!(TransportKind::Tcp.accepts(&v6));
        assert!(TransportKind::Tcp4.accepts(&v4));
        assert!(!TransportKind::Tcp4.accepts(&v6));
        assert!(TransportKind::Tcp6.accepts(&v6));
        assert!(!TransportKind::Tcp6.accepts(&v4));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 4444
            transport = "tcp4"
            max_line_length = 4096

            [demo]
            heartbeat_interval = 30

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.server.port, Some(4444));
        assert_eq!(config.server.transport, Some(TransportKind::Tcp4));
        assert_eq!(config.server.max_line_length, Some(4096));
        assert_eq!(config.server.backlog, None);
        assert_eq!(config.demo.heartbeat_interval, 30);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::parse_from(["linewire", "--port", "5555", "--log-level", "trace"]);
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 4444

            [demo]
            heartbeat_interval = 10
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, file);
        assert_eq!(config.server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.server.port, Some(5555));
        assert_eq!(config.heartbeat_interval, 10);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["linewire", "--config", "/nonexistent/linewire.toml"]);
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err
            .to_string()
            .starts_with("Failed to read config file '/nonexistent/linewire.toml': "));
    }
}
