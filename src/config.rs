//! Configuration management for unishell clients.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file (JSON)
//! 3. Default values

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default SSH client program.
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";

/// Default timeout for establishing the SSH master connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local backend parameters.
    pub local: LocalConfig,
    /// Remote backend parameters, if a remote target is configured.
    pub remote: Option<RemoteConfig>,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Parameters for the local backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Working directory for spawned commands.
    pub cwd: Option<PathBuf>,
    /// Shell used to interpret command strings. Platform default when unset.
    pub shell: Option<String>,
    /// Extra environment variables for every command.
    pub env: HashMap<String, String>,
}

impl LocalConfig {
    /// Local configuration rooted at `cwd`.
    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }
}

/// Parameters for the remote (SSH) backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Remote host name or address.
    pub host: String,
    /// Login user. Empty means the SSH client's default.
    pub user: String,
    /// Remote port.
    pub port: Option<u16>,
    /// Private key file.
    pub identity: Option<PathBuf>,
    /// SSH client program.
    pub ssh_program: String,
    /// Arguments placed before the generated ones on every invocation.
    pub extra_args: Vec<String>,
    /// Timeout for the initial handshake, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            port: None,
            identity: None,
            ssh_program: DEFAULT_SSH_PROGRAM.to_string(),
            extra_args: Vec::new(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl RemoteConfig {
    /// Remote configuration for `user@host`.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    /// Set the private key file.
    pub fn identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Some(path.into());
        self
    }

    /// Set the remote port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The SSH destination, `user@host` or just `host`.
    pub fn target(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    /// Check that the configuration names a reachable target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("remote host cannot be empty".into()));
        }
        if self.ssh_program.trim().is_empty() {
            return Err(ConfigError::Invalid("ssh program cannot be empty".into()));
        }
        Ok(())
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    ///
    /// Setting `UNISHELL_HOST` creates a remote section if none exists.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("UNISHELL_HOST") {
            if !host.is_empty() {
                self.remote.get_or_insert_with(RemoteConfig::default).host = host;
            }
        }

        if let Some(remote) = self.remote.as_mut() {
            if let Ok(user) = std::env::var("UNISHELL_USER") {
                remote.user = user;
            }

            if let Ok(port) = std::env::var("UNISHELL_PORT") {
                if let Ok(port) = port.parse() {
                    remote.port = Some(port);
                }
            }

            if let Ok(identity) = std::env::var("UNISHELL_IDENTITY") {
                if !identity.is_empty() {
                    remote.identity = Some(PathBuf::from(identity));
                }
            }
        }

        if let Ok(level) = std::env::var("UNISHELL_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env();

        if let Some(remote) = &config.remote {
            remote.validate()?;
        }

        Ok(config)
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Semantically invalid configuration.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
