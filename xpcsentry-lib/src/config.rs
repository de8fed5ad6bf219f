//! Configuration management with hierarchical overrides using figment.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Command-line flags (highest precedence, applied by the binaries)
//! 2. Environment variables (`XPCSENTRY_AGENT`_*, `XPCSENTRY_CLI`_*, `__` nests sections)
//! 3. An explicit configuration file, when one is given
//! 4. User configuration file (~/.config/xpcsentry/config.toml)
//! 5. System configuration file (/etc/xpcsentry/config.toml)
//! 6. Embedded defaults (lowest precedence)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::launchd::DEFAULT_SHMEM_SIZE;

/// Largest shared-memory region a request may allocate (64 MiB).
pub const MAX_SHMEM_SIZE: usize = 64 * 1024 * 1024;

const SYSTEM_CONFIG_PATH: &str = "/etc/xpcsentry/config.toml";

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] figment::Error),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

/// Main configuration structure for xpcsentry components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    /// Supervisor client and resolver settings
    pub launchd: LaunchdConfig,
    /// Code-signing tool locations
    pub codesign: CodesignConfig,
    /// Detection policy
    pub detection: DetectionConfig,
    /// Monitoring agent settings
    pub agent: AgentConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Supervisor client and resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchdConfig {
    /// Size of the shared-memory region each textual query allocates
    pub shmem_size_bytes: usize,
    /// Memoize per-domain service sweeps
    pub cache_enabled: bool,
    /// Retry failed detail queries with the attribute lookup routine
    pub attribute_fallback: bool,
}

impl Default for LaunchdConfig {
    fn default() -> Self {
        Self {
            shmem_size_bytes: DEFAULT_SHMEM_SIZE,
            cache_enabled: true,
            attribute_fallback: true,
        }
    }
}

/// Locations of the code-signing tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodesignConfig {
    pub codesign_path: PathBuf,
    pub plutil_path: PathBuf,
}

impl Default for CodesignConfig {
    fn default() -> Self {
        Self {
            codesign_path: PathBuf::from("/usr/bin/codesign"),
            plutil_path: PathBuf::from("/usr/bin/plutil"),
        }
    }
}

/// Detection policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Owner signing identifiers with one of these prefixes are never flagged
    pub trusted_signing_prefixes: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            trusted_signing_prefixes: vec!["com.apple.".to_owned()],
        }
    }
}

/// Output format for connection records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable single-line records
    #[default]
    Human,
    /// One JSON object per line
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::ValidationError {
                message: format!("unknown output format '{other}' (expected human or json)"),
            }),
        }
    }
}

/// Monitoring agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Capacity of the bounded channel between event source and pipeline
    pub channel_capacity: usize,
    /// Event kinds to subscribe to
    pub event_kinds: Vec<String>,
    /// Path of the endpoint-security logger
    pub eslogger_path: PathBuf,
    /// Record output format
    pub output_format: OutputFormat,
    /// Append JSON records to this file in addition to stdout
    pub output_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            event_kinds: vec!["xpc_connect".to_owned()],
            eslogger_path: PathBuf::from("/usr/bin/eslogger"),
            output_format: OutputFormat::Human,
            output_file: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, human)
    pub format: String,
    /// Log file path (optional, stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
            file: None,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
    file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader for the specified component.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            file: None,
        }
    }

    /// Also merge `path`, which must exist, above the system and user files.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Environment variable prefix for this component, e.g. `XPCSENTRY_AGENT_`.
    pub fn env_prefix(&self) -> String {
        format!("{}_", self.component.replace('-', "_").to_uppercase())
    }

    /// Load configuration with hierarchical overrides using figment.
    ///
    /// The result is not validated: callers apply their command-line
    /// overrides first and then call [`ConfigLoader::validate_config`].
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut figment = Figment::new()
            // Start with embedded defaults
            .merge(Serialized::defaults(Config::default()));

        if Path::new(SYSTEM_CONFIG_PATH).exists() {
            figment = figment.merge(Toml::file(SYSTEM_CONFIG_PATH));
        }

        if let Some(user_config_path) = Self::user_config_path(dirs::config_dir())
            && user_config_path.exists()
        {
            figment = figment.merge(Toml::file(&user_config_path));
        }

        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() });
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix()).split("__"));

        Ok(figment.extract()?)
    }

    /// User configuration file under the platform config directory.
    ///
    /// Without a config directory there is no user layer.
    fn user_config_path(config_dir: Option<PathBuf>) -> Option<PathBuf> {
        config_dir.map(|dir| dir.join("xpcsentry").join("config.toml"))
    }

    fn invalid(message: impl Into<String>) -> ConfigError {
        ConfigError::ValidationError {
            message: message.into(),
        }
    }

    /// Validate the final configuration.
    pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
        let shmem = config.launchd.shmem_size_bytes;
        if shmem == 0 || shmem > MAX_SHMEM_SIZE {
            return Err(Self::invalid(format!(
                "shmem_size_bytes must be between 1 and {MAX_SHMEM_SIZE}, got {shmem}"
            )));
        }

        if config.detection.trusted_signing_prefixes.iter().any(String::is_empty) {
            return Err(Self::invalid("trusted_signing_prefixes must not contain empty prefixes"));
        }

        if config.agent.channel_capacity == 0 {
            return Err(Self::invalid("channel_capacity must be greater than 0"));
        }

        if config.agent.event_kinds.is_empty() || config.agent.event_kinds.iter().any(String::is_empty) {
            return Err(Self::invalid("event_kinds must list at least one event kind"));
        }

        if !LOG_LEVELS.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(Self::invalid(format!(
                "unknown log level '{}'",
                config.logging.level
            )));
        }

        if !matches!(config.logging.format.as_str(), "human" | "json") {
            return Err(Self::invalid(format!(
                "unknown log format '{}'",
                config.logging.format
            )));
        }

        Ok(())
    }
}
