//! Configuration loading.
//!
//! Precedence, lowest to highest: built-in defaults, an optional JSON file,
//! then `NT_RELAY_*` environment variables. A value that fails to parse is
//! an error, never a silent fallback to the default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::supervisor::{Backoff, RetryPolicy};
use crate::ws::PeerAddress;

/// Reconnect delay growth, as written in config.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Constant interval.
    #[default]
    Fixed,
    /// Doubling interval up to `max_backoff_ms`.
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => anyhow::bail!("unknown backoff '{other}' (expected fixed or exponential)"),
        }
    }
}

/// Relay configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Peer host name or IP.
    pub peer_host: String,
    /// Peer WebSocket port.
    pub peer_port: u16,
    /// Peer WebSocket path.
    pub peer_path: String,
    /// HTTP bind address.
    pub listen_host: String,
    /// HTTP port.
    pub listen_port: u16,
    /// SQLite file backing the accumulation buffer.
    pub database_path: PathBuf,
    /// Base delay between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Bound on a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_connect_attempts: Option<u32>,
    /// Reconnect delay growth.
    pub backoff: BackoffKind,
    /// Cap on the exponential delay.
    pub max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_host: "127.0.0.1".to_string(),
            peer_port: 5810,
            peer_path: "/nt/1".to_string(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8000,
            database_path: default_database_path(),
            reconnect_interval_ms: 1000,
            connect_timeout_ms: 3000,
            max_connect_attempts: None,
            backoff: BackoffKind::Fixed,
            max_backoff_ms: 60_000,
        }
    }
}

/// `<platform data dir>/nt-relay/buffer.db`, relative to the working directory
/// if the platform has no data dir.
fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_default()
        .join("nt-relay")
        .join("buffer.db")
}

impl Config {
    /// Load defaults, then `path` (if given), then the environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply `NT_RELAY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("NT_RELAY_PEER_HOST") {
            self.peer_host = host;
        }
        if let Some(port) = lookup("NT_RELAY_PEER_PORT") {
            self.peer_port = parse_var("NT_RELAY_PEER_PORT", &port)?;
        }
        if let Some(path) = lookup("NT_RELAY_PEER_PATH") {
            self.peer_path = path;
        }
        if let Some(host) = lookup("NT_RELAY_LISTEN_HOST") {
            self.listen_host = host;
        }
        if let Some(port) = lookup("NT_RELAY_LISTEN_PORT") {
            self.listen_port = parse_var("NT_RELAY_LISTEN_PORT", &port)?;
        }
        if let Some(path) = lookup("NT_RELAY_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(ms) = lookup("NT_RELAY_RECONNECT_INTERVAL_MS") {
            self.reconnect_interval_ms = parse_var("NT_RELAY_RECONNECT_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("NT_RELAY_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_var("NT_RELAY_CONNECT_TIMEOUT_MS", &ms)?;
        }
        if let Some(max) = lookup("NT_RELAY_MAX_CONNECT_ATTEMPTS") {
            self.max_connect_attempts = Some(parse_var("NT_RELAY_MAX_CONNECT_ATTEMPTS", &max)?);
        }
        if let Some(kind) = lookup("NT_RELAY_BACKOFF") {
            self.backoff = parse_var("NT_RELAY_BACKOFF", &kind)?;
        }
        if let Some(ms) = lookup("NT_RELAY_MAX_BACKOFF_MS") {
            self.max_backoff_ms = parse_var("NT_RELAY_MAX_BACKOFF_MS", &ms)?;
        }
        Ok(())
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.peer_host.trim().is_empty() {
            anyhow::bail!("peer_host must not be empty");
        }
        if self.listen_host.trim().is_empty() {
            anyhow::bail!("listen_host must not be empty");
        }
        if self.peer_port == 0 {
            anyhow::bail!("peer_port must not be 0");
        }
        if self.listen_port == 0 {
            anyhow::bail!("listen_port must not be 0");
        }
        if self.reconnect_interval_ms == 0 {
            anyhow::bail!("reconnect_interval_ms must be greater than 0");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than 0");
        }
        if self.max_connect_attempts == Some(0) {
            anyhow::bail!("max_connect_attempts must be greater than 0 when set");
        }
        Ok(())
    }

    /// Peer address built from `peer_host`, `peer_port` and `peer_path`.
    #[must_use]
    pub fn peer(&self) -> PeerAddress {
        PeerAddress::new(&self.peer_host, self.peer_port, &self.peer_path)
    }

    /// Bound on a single connect attempt.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect policy for the supervisor.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max: Duration::from_millis(self.max_backoff_ms),
            },
        };
        RetryPolicy {
            interval: Duration::from_millis(self.reconnect_interval_ms),
            max_attempts: self.max_connect_attempts,
            backoff,
        }
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{name}={raw:?} is invalid: {e}"))
}
