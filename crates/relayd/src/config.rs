//! Gateway configuration.
//!
//! Loaded once at startup from a TOML file, then overridden by environment
//! variables and finally by command line flags. Every field has a default,
//! so an empty file (or no file at all) is a valid configuration.
//!
//! ```toml
//! listen_addr = "0.0.0.0:8000"
//! ws_path = "/ws"
//!
//! [upstream]
//! url = "ws://boat.local:8001/ws"
//! connect_timeout_ms = 5000
//! retry_interval_ms = 5000
//!
//! [credentials]
//! digests = ["10df398b..."]
//!
//! [log]
//! level = "info"
//! snapshot_log = "/var/log/boatrelay/snapshots.jsonl"
//! ```

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::CredentialDigest;

/// Environment variable overriding the upstream URL.
pub const ENV_UPSTREAM_URL: &str = "BOATPI_WS";

/// Environment variable overriding the listen port.
pub const ENV_LISTEN_PORT: &str = "APP_PORT";

/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Levels accepted by `log.level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Environment variable adding comma separated allow-list digests.
pub const ENV_ADMIN_TOKENS: &str = "RELAY_ADMIN_TOKENS";

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the client-facing WebSocket server binds to.
    pub listen_addr: SocketAddr,
    /// HTTP path of the WebSocket endpoint.
    pub ws_path: String,
    pub upstream: UpstreamConfig,
    pub credentials: CredentialsConfig,
    pub log: LogConfig,
}

/// Connection to the boat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// WebSocket URL of the boat's onboard controller.
    pub url: String,
    /// Timeout of a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Period of the reconnect timer.
    pub retry_interval_ms: u64,
    /// Send a WebSocket ping on every timer tick while connected.
    pub keep_alive_ping: bool,
}

/// Crew allow-list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Hex SHA-512 digests of `username§password`.
    pub digests: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing level (trace, debug, info, warn, error).
    pub level: String,
    /// JSON-lines file receiving one merged snapshot per telemetry update.
    pub snapshot_log: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            ws_path: "/ws".to_string(),
            upstream: UpstreamConfig::default(),
            credentials: CredentialsConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8001/ws".to_string(),
            connect_timeout_ms: 5_000,
            retry_interval_ms: 5_000,
            keep_alive_ping: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            snapshot_log: None,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl RelayConfig {
    /// Loads the configuration.
    ///
    /// Reads `path` when given, otherwise the default config file if it
    /// exists, otherwise starts from defaults. Environment overrides are
    /// applied on top and the result is validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.log.level = normalize_level(&config.log.level);
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parses TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            error: e.to_string(),
        })
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// Taking the lookup as a function keeps tests away from the process
    /// environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_UPSTREAM_URL) {
            self.upstream.url = url;
        }

        if let Some(port) = lookup(ENV_LISTEN_PORT) {
            let port: u16 = port.trim().parse().map_err(|_| ConfigError::Invalid {
                field: ENV_LISTEN_PORT,
                reason: format!("'{port}' is not a port number"),
            })?;
            self.listen_addr.set_port(port);
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log.level = normalize_level(&level);
        }

        if let Some(tokens) = lookup(ENV_ADMIN_TOKENS) {
            self.credentials.digests.extend(
                tokens
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned),
            );
        }

        Ok(())
    }

    /// Checks field values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "upstream.url",
                reason: "must not be empty".to_string(),
            });
        }

        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "ws_path",
                reason: format!("'{}' must start with '/'", self.ws_path),
            });
        }

        if self.upstream.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "upstream.connect_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.upstream.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "upstream.retry_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::Invalid {
                field: "log.level",
                reason: format!(
                    "'{}' is not one of {}",
                    self.log.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }

        for digest in &self.credentials.digests {
            if CredentialDigest::from_hex(digest).is_none() {
                return Err(ConfigError::InvalidDigest {
                    digest: digest.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Maps a level name onto the tracing spelling.
///
/// Case is ignored and the syslog style names `warning`, `critical` and
/// `fatal` are accepted. Anything else is returned lowercased for
/// [`RelayConfig::validate`] to reject.
pub fn normalize_level(level: &str) -> String {
    let level = level.trim().to_lowercase();
    match level.as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        _ => level,
    }
}

/// Returns the default config file location
/// (`~/.config/boatrelay/relayd.toml` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("boatrelay").join("relayd.toml"))
}

/// Errors that can occur while loading the configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid credential digest '{digest}' (expected 128 hex characters)")]
    InvalidDigest { digest: String },
}
