//! Configuration
//!
//! Settings are layered: built-in defaults, then an optional JSON file,
//! then `RELAY_*` environment variables. The result is validated before
//! the server starts.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::backend::auth::TokenConfig;
use crate::backend::BackendTimeouts;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Config file is not valid JSON for [`RelayConfig`].
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// Environment variable has an unusable value.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// Settings are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Connections beyond this are refused.
    pub max_connections: usize,
    /// Time allowed for sessions to drain on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 10_000,
            shutdown_grace_secs: 20,
        }
    }
}

/// Per-connection transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSection {
    /// Upgrade path.
    pub path: String,
    /// Largest accepted frame/message in bytes.
    pub max_message_size: usize,
    /// Deadline for writing one frame.
    pub write_wait_secs: u64,
    /// Read deadline; refreshed by any inbound frame.
    pub pong_wait_secs: u64,
    /// Keep-alive interval. Must be shorter than `pong_wait_secs`.
    pub ping_period_secs: u64,
    /// Outbound queue capacity per session.
    pub outbound_queue: usize,
    /// Deadline for the upgrade handshake after the TCP accept.
    pub handshake_timeout_secs: u64,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_message_size: 32 * 1024,
            write_wait_secs: 10,
            pong_wait_secs: 60,
            ping_period_secs: 45,
            outbound_queue: 256,
            handshake_timeout_secs: 10,
        }
    }
}

impl WebSocketSection {
    /// Write deadline.
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    /// Read deadline.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keep-alive interval.
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    /// Upgrade handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Backend client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Timeout for ordinary calls.
    pub call_timeout_secs: u64,
    /// Timeout for room creation.
    pub create_timeout_secs: u64,
    /// HMAC secret for session tokens.
    pub token_secret: String,
    /// Session token lifetime.
    pub token_ttl_secs: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        let tokens = TokenConfig::default();
        Self {
            call_timeout_secs: 5,
            create_timeout_secs: 10,
            token_secret: tokens.secret,
            token_ttl_secs: tokens.ttl_secs,
        }
    }
}

impl BackendSection {
    /// Per-call timeouts.
    pub fn timeouts(&self) -> BackendTimeouts {
        BackendTimeouts {
            call: Duration::from_secs(self.call_timeout_secs),
            create: Duration::from_secs(self.create_timeout_secs),
        }
    }

    /// Token settings for the in-process backend.
    pub fn tokens(&self) -> TokenConfig {
        TokenConfig {
            secret: self.token_secret.clone(),
            ttl_secs: self.token_ttl_secs,
            ..TokenConfig::default()
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// =============================================================================
// RELAY CONFIG
// =============================================================================

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener.
    pub server: ServerSection,
    /// Transport.
    pub websocket: WebSocketSection,
    /// Backend client.
    pub backend: BackendSection,
    /// Logging.
    pub log: LogSection,
}

fn parse_env<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

impl RelayConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `RELAY_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAY_BIND_ADDR") {
            self.server.bind_addr = parse_env("RELAY_BIND_ADDR", v)?;
        }
        if let Some(v) = lookup("RELAY_MAX_CONNECTIONS") {
            self.server.max_connections = parse_env("RELAY_MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = lookup("RELAY_WS_PATH") {
            self.websocket.path = v;
        }
        if let Some(v) = lookup("RELAY_WS_MAX_MESSAGE_SIZE") {
            self.websocket.max_message_size = parse_env("RELAY_WS_MAX_MESSAGE_SIZE", v)?;
        }
        if let Some(v) = lookup("RELAY_WS_PONG_WAIT_SECS") {
            self.websocket.pong_wait_secs = parse_env("RELAY_WS_PONG_WAIT_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_WS_PING_PERIOD_SECS") {
            self.websocket.ping_period_secs = parse_env("RELAY_WS_PING_PERIOD_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_WS_WRITE_WAIT_SECS") {
            self.websocket.write_wait_secs = parse_env("RELAY_WS_WRITE_WAIT_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_WS_OUTBOUND_QUEUE") {
            self.websocket.outbound_queue = parse_env("RELAY_WS_OUTBOUND_QUEUE", v)?;
        }
        if let Some(v) = lookup("RELAY_WS_HANDSHAKE_TIMEOUT_SECS") {
            self.websocket.handshake_timeout_secs =
                parse_env("RELAY_WS_HANDSHAKE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_BACKEND_TIMEOUT_SECS") {
            self.backend.call_timeout_secs = parse_env("RELAY_BACKEND_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_TOKEN_SECRET") {
            self.backend.token_secret = v;
        }
        if let Some(v) = lookup("RELAY_LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.websocket;
        if !ws.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "websocket.path must start with '/': {:?}",
                ws.path
            )));
        }
        if ws.max_message_size == 0 {
            return Err(ConfigError::Invalid("websocket.max_message_size must be non-zero".into()));
        }
        if ws.outbound_queue == 0 {
            return Err(ConfigError::Invalid("websocket.outbound_queue must be non-zero".into()));
        }
        if ws.write_wait_secs == 0
            || ws.pong_wait_secs == 0
            || ws.ping_period_secs == 0
            || ws.handshake_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("websocket timeouts must be non-zero".into()));
        }
        if ws.ping_period_secs >= ws.pong_wait_secs {
            return Err(ConfigError::Invalid(format!(
                "websocket.ping_period_secs ({}) must be shorter than pong_wait_secs ({})",
                ws.ping_period_secs, ws.pong_wait_secs
            )));
        }
        if self.backend.call_timeout_secs == 0 || self.backend.create_timeout_secs == 0 {
            return Err(ConfigError::Invalid("backend timeouts must be non-zero".into()));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be non-zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
