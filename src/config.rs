//! Configuration for the echo server and the load client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::RetryPolicy;
use crate::protocol::DEFAULT_MAX_PAYLOAD;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Well-known port used by both sides when none is given.
pub const DEFAULT_PORT: u16 = 15000;

/// Largest payload the client will build per message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "frame-echo")]
#[command(version = "0.1.0")]
#[command(about = "Length-prefixed echo server and load-generating client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Server(ServerArgs),
    /// Run the load-generating client
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Number of event loop threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Largest accepted payload in bytes
    #[arg(long)]
    pub max_payload: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address
    #[arg(short = 'i', long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of connections to open
    #[arg(short, long)]
    pub connections: Option<usize>,

    /// Messages sent on each connection
    #[arg(short, long)]
    pub messages: Option<u32>,

    /// Payload size in bytes
    #[arg(short, long)]
    pub size: Option<usize>,

    /// Connections in flight at once
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]` table
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub max_payload: usize,
    /// Events fetched per poll call
    pub max_events: usize,
    pub header_timeout_ms: u64,
    pub payload_timeout_ms: u64,
    pub drain_trailing: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            workers: None,
            max_connections: 100_000,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_events: 1024,
            header_timeout_ms: 3_000,
            payload_timeout_ms: 5_000,
            drain_trailing: true,
        }
    }
}

/// `[client]` table
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub host: String,
    pub port: u16,
    pub connections: usize,
    pub messages: u32,
    pub size: usize,
    pub concurrency: Option<usize>,
    pub connect_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_window_ms: u64,
    pub message_delay_ms: u64,
    pub ramp_batch: usize,
    pub ramp_pause_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connections: 100,
            messages: 10,
            size: 1024,
            concurrency: None,
            connect_timeout_ms: 5_000,
            retry_attempts: 5,
            retry_window_ms: 5_000,
            message_delay_ms: 1,
            ramp_batch: 100,
            ramp_pause_ms: 10,
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 0 = one per CPU core
    pub workers: usize,
    pub max_connections: usize,
    pub max_payload: usize,
    pub max_events: usize,
    pub header_timeout: Duration,
    pub payload_timeout: Duration,
    pub drain_trailing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerSection::default().into()
    }
}

impl From<ServerSection> for ServerConfig {
    fn from(s: ServerSection) -> Self {
        Self {
            host: s.host,
            port: s.port,
            workers: s.workers.unwrap_or(0),
            max_connections: s.max_connections,
            max_payload: s.max_payload,
            max_events: s.max_events,
            header_timeout: Duration::from_millis(s.header_timeout_ms),
            payload_timeout: Duration::from_millis(s.payload_timeout_ms),
            drain_trailing: s.drain_trailing,
        }
    }
}

impl ServerConfig {
    /// Number of event loop threads to run.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    /// Resolve `host:port` to a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload == 0 || self.max_payload > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_payload must be in 1..={}",
                u32::MAX
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be > 0".into()));
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid("max_events must be > 0".into()));
        }
        Ok(())
    }
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connections: usize,
    pub messages_per_conn: u32,
    pub message_size: usize,
    /// Connection workers allowed to run at once
    pub concurrency: usize,
    pub connect_timeout: Duration,
    /// Per-phase wait for the echoed header and payload
    pub retry: RetryPolicy,
    /// Pause between successful cycles on one connection
    pub message_delay: Duration,
    /// Spawn this many workers before pausing
    pub ramp_batch: usize,
    pub ramp_pause: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientSection::default().into()
    }
}

impl From<ClientSection> for ClientConfig {
    fn from(s: ClientSection) -> Self {
        Self {
            concurrency: s.concurrency.unwrap_or_else(|| s.connections.clamp(1, 1024)),
            host: s.host,
            port: s.port,
            connections: s.connections,
            messages_per_conn: s.messages,
            message_size: s.size,
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            retry: RetryPolicy::new(s.retry_attempts, Duration::from_millis(s.retry_window_ms)),
            message_delay: Duration::from_millis(s.message_delay_ms),
            ramp_batch: s.ramp_batch,
            ramp_pause: Duration::from_millis(s.ramp_pause_ms),
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.message_size > MAX_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "message size must be at most {MAX_MESSAGE_SIZE}"
            )));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be > 0".into()));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be > 0".into()));
        }
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::Address(format!("{host}:{port}"), e.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::Address(format!("{host}:{port}"), "no address".into()))
}

/// Which side to run, with its resolved configuration.
#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = cli.log_level.unwrap_or(toml_config.logging.level);

        let mode = match cli.command {
            Command::Server(args) => {
                let mut section = toml_config.server;
                section.port = args.port.unwrap_or(section.port);
                section.host = args.host.unwrap_or(section.host);
                section.workers = args.workers.or(section.workers);
                section.max_connections = args.max_connections.unwrap_or(section.max_connections);
                section.max_payload = args.max_payload.unwrap_or(section.max_payload);

                let config = ServerConfig::from(section);
                config.validate()?;
                Mode::Server(config)
            }
            Command::Client(args) => {
                let mut section = toml_config.client;
                section.host = args.host.unwrap_or(section.host);
                section.port = args.port.unwrap_or(section.port);
                section.connections = args.connections.unwrap_or(section.connections);
                section.messages = args.messages.unwrap_or(section.messages);
                section.size = args.size.unwrap_or(section.size);
                section.concurrency = args.concurrency.or(section.concurrency);

                let config = ClientConfig::from(section);
                config.validate()?;
                Mode::Client(config)
            }
        };

        Ok(Config { mode, log_level })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Address(String, String),
    Invalid(String),
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
            ConfigError::Address(addr, e) => write!(f, "Invalid address '{addr}': {e}"),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::from_cli(CliArgs::try_parse_from(args).unwrap()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.port, 15000);
        assert_eq!(config.server.max_payload, 16 * 1024);
        assert_eq!(config.client.connections, 100);
        assert_eq!(config.client.messages, 10);
        assert_eq!(config.client.size, 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            port = 16000
            workers = 4
            header_timeout_ms = 1000

            [client]
            host = "10.0.0.1"
            connections = 8
            retry_attempts = 3

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 16000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.header_timeout_ms, 1000);
        // Unset fields keep their defaults
        assert_eq!(config.server.payload_timeout_ms, 5000);
        assert_eq!(config.client.host, "10.0.0.1");
        assert_eq!(config.client.connections, 8);
        assert_eq!(config.client.retry_attempts, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_server_positional_port() {
        let config = parse(&["frame-echo", "server", "16000", "-w", "2"]);
        match config.mode {
            Mode::Server(server) => {
                assert_eq!(server.port, 16000);
                assert_eq!(server.worker_count(), 2);
                assert_eq!(server.header_timeout, Duration::from_secs(3));
                assert_eq!(server.payload_timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_client_flags() {
        let config = parse(&[
            "frame-echo", "client", "-i", "127.0.0.1", "-p", "15001", "-c", "4", "-m", "3", "-s",
            "16", "--log-level", "warn",
        ]);
        match config.mode {
            Mode::Client(client) => {
                assert_eq!(client.port, 15001);
                assert_eq!(client.connections, 4);
                assert_eq!(client.messages_per_conn, 3);
                assert_eq!(client.message_size, 16);
                assert_eq!(client.concurrency, 4);
                assert_eq!(client.retry.attempts, 5);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_invalid_option_is_rejected() {
        assert!(CliArgs::try_parse_from(["frame-echo", "client", "--bogus"]).is_err());
        assert!(CliArgs::try_parse_from(["frame-echo", "server", "notaport"]).is_err());
    }

    #[test]
    fn test_oversized_message_is_invalid() {
        let cli = CliArgs::try_parse_from(["frame-echo", "client", "-s", "67108865"]).unwrap();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::Invalid(_))));

        let cli = CliArgs::try_parse_from(["frame-echo", "client", "-s", "67108864"]).unwrap();
        assert!(Config::from_cli(cli).is_ok());
    }

    #[test]
    fn test_zero_max_payload_is_invalid() {
        let cli = CliArgs::try_parse_from(["frame-echo", "server", "--max-payload", "0"]).unwrap();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::Invalid(_))));
    }
}
