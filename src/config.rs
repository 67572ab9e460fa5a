//! Configuration module for the relay
//!
//! This module handles CLI argument parsing with environment variable support,
//! endpoint parsing and loading of the JSON filter rule file.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RelayError;

/// Host used when an address omits the server part (e.g. ":8080")
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default maximum chunk size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 65535;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try parsing as humantime duration first (e.g., "60s", "2m", "1h30m")
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Plain seconds, fractional values allowed ("0.5" is half a second)
    s.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| {
            format!(
                "Invalid duration '{}'. Use formats like '500ms', '60s', '2m' or plain seconds",
                s
            )
        })
}

/// Transport kind the relay operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Connection-oriented stream transport
    Tcp,
    /// Connectionless datagram transport
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `[server]:port`.
    ///
    /// The port is whatever follows the last colon, so both `::1:8080` and
    /// `[::1]:8080` are accepted. An empty server part falls back to `default_host`.
    pub fn parse(text: &str, default_host: &str) -> Result<Self, RelayError> {
        let text = text.trim();
        let (host, port) = text.rsplit_once(':').unwrap_or(("", text));

        let host = host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let host = if host.is_empty() { default_host } else { host };

        let port = port.trim().parse::<u16>().map_err(|_| {
            RelayError::Config(format!(
                "invalid address '{}': must be in the format of [server]:port",
                text
            ))
        })?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve to the first socket address the host maps to
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address found for {}", self),
                )
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Literal replacement rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplaceRule {
    #[serde(alias = "Old")]
    pub old: String,
    #[serde(alias = "New")]
    pub new: String,
}

/// Regex replacement rule; `new` may reference capture groups (`$1`, `${name}`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegexReplaceRule {
    #[serde(alias = "Reg")]
    pub reg: String,
    #[serde(alias = "New")]
    pub new: String,
}

/// Filter rule set as loaded from the JSON config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// Chunks containing any of these literals are dropped
    pub drop: Vec<String>,
    /// Chunks matching any of these patterns are dropped
    #[serde(rename = "drop-reg")]
    pub drop_reg: Vec<String>,
    /// Literals removed from every chunk
    pub exclude: Vec<String>,
    pub replace: Vec<ReplaceRule>,
    #[serde(rename = "replace-reg")]
    pub replace_reg: Vec<RegexReplaceRule>,
}

impl FilterRules {
    /// Load rules from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        self.drop.is_empty()
            && self.drop_reg.is_empty()
            && self.exclude.is_empty()
            && self.replace.is_empty()
            && self.replace_reg.is_empty()
    }
}

/// CLI arguments for the relay
///
/// Supports environment variables with PROTHO_ prefix
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Relay TCP connections or UDP datagrams to a fixed upstream"
)]
pub struct CliArgs {
    /// The source port (and IP) to listen on, in the format of [server]:port.
    /// If the server is not specified, it defaults to 0.0.0.0.
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// The destination port (and server) to forward data to, in the format of
    /// [server]:port. If the server is not specified, it defaults to 0.0.0.0.
    #[arg(value_name = "DESTINATION")]
    pub destination: String,

    /// The protocol to relay
    #[arg(
        short,
        long,
        env = "PROTHO_PROTOCOL",
        value_enum,
        default_value_t = TransportKind::Tcp
    )]
    pub protocol: TransportKind,

    /// Close a connection/session after this long without packets (e.g. "30s", "1.5").
    /// Zero means no timeout.
    #[arg(short = 't', long = "timeout", env = "PROTHO_TIMEOUT", default_value = "0", value_parser = parse_duration)]
    pub idle_timeout: Duration,

    /// How many bytes to relay in one chunk at maximum
    #[arg(short, long, env = "PROTHO_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Print information about inbound and outbound connections
    #[arg(short, long, env = "PROTHO_VERBOSE")]
    pub verbose: bool,

    /// Crash on accept/dial/receive errors instead of ignoring them
    #[arg(short, long, env = "PROTHO_STRICT")]
    pub strict: bool,

    /// JSON file with filter rules (drop, drop-reg, exclude, replace, replace-reg)
    #[arg(short, long, env = "PROTHO_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Log mode: trace, debug, info, warn, error
    #[arg(long, env = "PROTHO_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// Upstream TCP connect timeout, zero disables it
    #[arg(long, env = "PROTHO_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY on relayed TCP sockets
    #[arg(
        long,
        env = "PROTHO_TCP_NODELAY",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// TCP listen backlog for pending connections
    #[arg(
        long,
        env = "PROTHO_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Immutable relay configuration handed to the core
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub transport: TransportKind,
    pub listen: Endpoint,
    pub upstream: Endpoint,
    /// Maximum bytes read per chunk
    pub buffer_size: usize,
    /// Per-read idle deadline, zero disables it
    pub idle_timeout: Duration,
    /// Upstream stream dial timeout, zero disables it
    pub connect_timeout: Duration,
    pub strict: bool,
    pub verbose: bool,
    pub tcp_nodelay: bool,
    pub tcp_backlog: i32,
    pub filters: FilterRules,
}

impl RelayConfig {
    /// Config with defaults for everything but the transport and addresses
    pub fn new(transport: TransportKind, listen: Endpoint, upstream: Endpoint) -> Self {
        Self {
            transport,
            listen,
            upstream,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(5),
            strict: false,
            verbose: false,
            tcp_nodelay: true,
            tcp_backlog: 1024,
            filters: FilterRules::default(),
        }
    }

    /// Build from CLI args, loading the filter file if one is given
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let listen = Endpoint::parse(&cli.source, DEFAULT_HOST)?;
        let upstream = Endpoint::parse(&cli.destination, DEFAULT_HOST)?;

        let filters = match cli.config_file {
            Some(ref path) => FilterRules::load(path)?,
            None => FilterRules::default(),
        };

        let config = Self {
            transport: cli.protocol,
            listen,
            upstream,
            buffer_size: cli.buffer_size,
            idle_timeout: cli.idle_timeout,
            connect_timeout: cli.connect_timeout,
            strict: cli.strict,
            verbose: cli.verbose,
            tcp_nodelay: cli.tcp_nodelay,
            tcp_backlog: cli.tcp_backlog,
            filters,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.buffer_size == 0 {
            return Err(RelayError::Config(
                "buffer size must be a positive number".to_string(),
            ));
        }
        if self.tcp_backlog <= 0 {
            return Err(RelayError::Config(
                "tcp backlog must be a positive number".to_string(),
            ));
        }
        Ok(())
    }

    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (!self.idle_timeout.is_zero()).then_some(self.idle_timeout)
    }

    /// Connect timeout, `None` when disabled
    pub fn connect_timeout(&self) -> Option<Duration> {
        (!self.connect_timeout.is_zero()).then_some(self.connect_timeout)
    }
}
