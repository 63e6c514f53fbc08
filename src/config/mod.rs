//! Configuration management
//!
//! [`Config`] is the raw form read from TOML and the command line.
//! [`Config::validate`] turns it into [`TunnelSettings`], the only form the
//! rest of the crate accepts.

use crate::protocol::{
    Protocol, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PURGE_SIZE, DEFAULT_READ_DURATION,
    DEFAULT_TUNNEL_TIMEOUT, DEFAULT_UDP_IDLE_TIMEOUT,
};
use crate::transport::ChannelSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Smallest accepted purge size
pub const MIN_PURGE_SIZE: u64 = 4096;

/// Listen address used when a rule gives none
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid forwarding rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File the peer writes
    pub read_from: PathBuf,
    /// File this instance writes
    pub write_to: PathBuf,
    /// Write file size that triggers a purge, in bytes
    pub purge_size: u64,
    /// Silence on the read file before all streams are closed
    pub tunnel_timeout_ms: u64,
    /// Copy the read file before parsing it (RDP drive redirection)
    pub isolated_reads: bool,
    /// Poll interval of the read file
    pub read_duration_ms: u64,
    /// Local TCP listeners, `[listenAddr:]listenPort:targetAddr:targetPort`
    pub tcp_forwards: Vec<String>,
    /// Local UDP listeners
    pub udp_forwards: Vec<String>,
    /// TCP listeners the peer opens, connecting back through this side
    pub remote_tcp_forwards: Vec<String>,
    /// UDP listeners the peer opens
    pub remote_udp_forwards: Vec<String>,
    /// Source address for outbound UDP sockets
    pub udp_send_from: String,
    pub udp_idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Debug logging
    pub verbose: bool,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the configuration and build the settings the tunnel runs with
    pub fn validate(&self) -> Result<TunnelSettings, ConfigError> {
        if self.read_from.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("read-from path is required".to_string()));
        }
        if self.write_to.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("write-to path is required".to_string()));
        }
        if self.read_from == self.write_to {
            return Err(ConfigError::Invalid(
                "read-from and write-to must be different files".to_string(),
            ));
        }
        if self.read_duration_ms == 0 {
            return Err(ConfigError::Invalid("read duration must be positive".to_string()));
        }
        if self.tunnel_timeout_ms == 0 {
            return Err(ConfigError::Invalid("tunnel timeout must be positive".to_string()));
        }
        if self.purge_size < MIN_PURGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "purge size must be at least {} bytes",
                MIN_PURGE_SIZE
            )));
        }

        let udp_send_from: IpAddr = self.udp_send_from.parse().map_err(|_| {
            ConfigError::Invalid(format!("invalid udp-send-from address '{}'", self.udp_send_from))
        })?;

        let mut forwards = parse_rules(Protocol::Tcp, &self.tcp_forwards)?;
        forwards.extend(parse_rules(Protocol::Udp, &self.udp_forwards)?);
        check_duplicates(&forwards)?;

        let mut remote_forwards = parse_rules(Protocol::Tcp, &self.remote_tcp_forwards)?;
        remote_forwards.extend(parse_rules(Protocol::Udp, &self.remote_udp_forwards)?);
        check_duplicates(&remote_forwards)?;

        if self.read_from.to_string_lossy().contains("thinclient_drives") && !self.isolated_reads {
            warn!(
                "{} looks like a redirected RDP drive; consider --isolated-reads",
                self.read_from.display()
            );
        }

        Ok(TunnelSettings {
            channel: ChannelSettings {
                read_from: self.read_from.clone(),
                write_to: self.write_to.clone(),
                purge_size: self.purge_size,
                tunnel_timeout: Duration::from_millis(self.tunnel_timeout_ms),
                read_duration: Duration::from_millis(self.read_duration_ms),
                isolated_reads: self.isolated_reads,
            },
            forwards,
            remote_forwards,
            udp_send_from,
            udp_idle_timeout: Duration::from_millis(self.udp_idle_timeout_ms.max(1)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.max(1)),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_from: PathBuf::new(),
            write_to: PathBuf::new(),
            purge_size: DEFAULT_PURGE_SIZE,
            tunnel_timeout_ms: DEFAULT_TUNNEL_TIMEOUT.as_millis() as u64,
            isolated_reads: false,
            read_duration_ms: DEFAULT_READ_DURATION.as_millis() as u64,
            tcp_forwards: Vec::new(),
            udp_forwards: Vec::new(),
            remote_tcp_forwards: Vec::new(),
            remote_udp_forwards: Vec::new(),
            udp_send_from: "0.0.0.0".to_string(),
            udp_idle_timeout_ms: DEFAULT_UDP_IDLE_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            verbose: false,
        }
    }
}

/// Validated configuration
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub channel: ChannelSettings,
    /// Rules this instance listens for
    pub forwards: Vec<ForwardRule>,
    /// Rules announced to the peer
    pub remote_forwards: Vec<ForwardRule>,
    pub udp_send_from: IpAddr,
    pub udp_idle_timeout: Duration,
    pub connect_timeout: Duration,
}

/// A host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host:port`, with IPv6 hosts in brackets
    pub fn parse(text: &str) -> Result<Self, String> {
        let (host, port) = text
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in '{}'", text))?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| format!("unbalanced brackets in '{}'", text))?,
            None => host,
        };
        Ok(Self {
            host: parse_host(host)?,
            port: parse_port(port)?,
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

/// A forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub protocol: Protocol,
    pub listen: Endpoint,
    pub target: Endpoint,
}

impl ForwardRule {
    /// Parse `[listenAddr:]listenPort:targetAddr:targetPort`
    pub fn parse(protocol: Protocol, text: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            rule: text.to_string(),
            reason,
        };

        let parts = split_rule(text).map_err(invalid)?;
        let (listen_host, rest) = match parts.len() {
            3 => (DEFAULT_LISTEN_HOST.to_string(), &parts[..]),
            4 => (parse_host(&parts[0]).map_err(invalid)?, &parts[1..]),
            n => return Err(invalid(format!("expected 3 or 4 fields, found {}", n))),
        };

        let listen = Endpoint {
            host: listen_host,
            port: parse_port(&rest[0]).map_err(invalid)?,
        };
        let target = Endpoint {
            host: parse_host(&rest[1]).map_err(invalid)?,
            port: parse_port(&rest[2]).map_err(invalid)?,
        };
        if target.port == 0 {
            return Err(invalid("target port must not be 0".to_string()));
        }

        Ok(Self {
            protocol,
            listen,
            target,
        })
    }

    /// Build a rule from the endpoints of a listen request
    pub fn from_endpoints(protocol: Protocol, listen: &str, target: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            rule: format!("{}:{}", listen, target),
            reason,
        };
        Ok(Self {
            protocol,
            listen: Endpoint::parse(listen).map_err(invalid)?,
            target: Endpoint::parse(target).map_err(invalid)?,
        })
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.listen, self.target)
    }
}

fn parse_rules(protocol: Protocol, rules: &[String]) -> Result<Vec<ForwardRule>, ConfigError> {
    rules
        .iter()
        .map(|rule| ForwardRule::parse(protocol, rule))
        .collect()
}

fn check_duplicates(rules: &[ForwardRule]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert((rule.protocol, &rule.listen)) {
            return Err(ConfigError::Invalid(format!(
                "duplicate {} listen endpoint {}",
                rule.protocol, rule.listen
            )));
        }
    }
    Ok(())
}

/// Split on colons outside of brackets
fn split_rule(text: &str) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut bracketed = false;

    for c in text.chars() {
        match c {
            '[' if !bracketed && current.is_empty() => bracketed = true,
            ']' if bracketed => bracketed = false,
            ':' if !bracketed => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if bracketed {
        return Err("unbalanced brackets".to_string());
    }
    parts.push(current);
    Ok(parts)
}

fn parse_host(host: &str) -> Result<String, String> {
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    if host.chars().any(char::is_whitespace) {
        return Err(format!("invalid host '{}'", host));
    }
    if host.contains(':') && host.parse::<Ipv6Addr>().is_err() {
        return Err(format!("invalid IPv6 address '{}'", host));
    }
    Ok(host.to_string())
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse()
        .map_err(|_| format!("invalid port '{}'", port))
}
