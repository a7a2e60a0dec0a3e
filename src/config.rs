//! Connection settings for the debugger plugin and the reference peer.
//!
//! Values come from the environment first; the command line overrides them.

use std::net::Ipv6Addr;
use std::time::Duration;

use thiserror::Error;

/// Default plugin host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default plugin port.
pub const DEFAULT_PORT: u16 = 5645;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default delay before the reference peer reports a breakpoint stop.
pub const DEFAULT_STOP_DELAY: Duration = Duration::from_millis(100);

pub const ENV_HOST: &str = "RAD_PLUGIN_HOST";
pub const ENV_PORT: &str = "RAD_PLUGIN_PORT";
pub const ENV_TOKEN: &str = "RAD_PLUGIN_TOKEN";
pub const ENV_TIMEOUT_SECS: &str = "RAD_PLUGIN_TIMEOUT_SECS";
pub const ENV_LOG_EVENTS: &str = "RAD_PLUGIN_LOG_EVENTS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Client-side settings for reaching the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret sent in the `auth/handshake` notification.
    pub token: Option<String>,
    /// Per-call timeout used by `call_default`.
    pub timeout: Duration,
    /// Start the background event logger on connect. It consumes events, so
    /// `poll_events` will not see them.
    pub log_events: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            log_events: false,
        }
    }
}

impl RpcConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from `RAD_PLUGIN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup (tests use a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            config.port = parse_var(ENV_PORT, &port)?;
        }
        config.token = lookup(ENV_TOKEN).filter(|t| !t.is_empty());
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            config.timeout = parse_timeout(ENV_TIMEOUT_SECS, &secs)?;
        }
        if let Some(flag) = lookup(ENV_LOG_EVENTS) {
            config.log_events = parse_flag(ENV_LOG_EVENTS, &flag)?;
        }

        Ok(config)
    }

    /// `host:port` for `TcpStream::connect`.
    pub fn address(&self) -> String {
        socket_address(&self.host, self.port)
    }
}

/// Settings for the reference peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub host: String,
    /// Port 0 binds an ephemeral port.
    pub port: u16,
    /// When set, requests are rejected until a matching handshake arrives.
    pub token: Option<String>,
    pub stop_delay: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            token: None,
            stop_delay: DEFAULT_STOP_DELAY,
        }
    }
}

impl PeerConfig {
    /// Loopback peer on an ephemeral port, as used in tests.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn address(&self) -> String {
        socket_address(&self.host, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

/// Join host and port, bracketing bare IPv6 literals.
fn socket_address(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Whole seconds, at least one.
fn parse_timeout(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse_var::<u64>(var, value)? {
        0 => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}
