//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use unraid_core::{DEFAULT_PROBE_TIMEOUT, DiscoveryOptions, PollConfig};
use unraid_types::{ConnectionConfig, DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, normalize_host};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server connection settings.
    pub server: ServerConfig,
    /// Poll settings applied to every job unless overridden.
    pub defaults: PollSettings,
    /// Queries to poll.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// This checks:
    /// - The host is present and looks like a hostname
    /// - The API key is present
    /// - Ports and timeout are non-zero
    /// - Poll settings (defaults and per-job) are usable
    /// - Job ids are present and unique, and every job has a query
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.defaults.validate("defaults"));

        let mut seen_ids = std::collections::HashSet::new();
        for (i, job) in self.jobs.iter().enumerate() {
            let prefix = format!("jobs[{}]", i);
            errors.extend(job.validate(&prefix, &self.defaults));

            if !job.id.is_empty() && !seen_ids.insert(job.id.as_str()) {
                errors.push(ValidationError {
                    field: format!("{}.id", prefix),
                    message: format!("duplicate job id '{}'", job.id),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or IP address of the server.
    pub host: String,
    /// API key created in the Unraid web UI.
    pub api_key: String,
    /// Plain HTTP port.
    pub http_port: u16,
    /// HTTPS port.
    pub https_port: u16,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Capacity of the query event channel.
    pub broadcast_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            api_key: String::new(),
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            timeout_secs: 10,
            broadcast_buffer: 100,
        }
    }
}

impl ServerConfig {
    /// Validate server settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.host.trim().is_empty() {
            errors.push(ValidationError {
                field: "server.host".to_string(),
                message: "host cannot be empty".to_string(),
            });
        } else if let Err(e) = normalize_host(&self.host) {
            errors.push(ValidationError {
                field: "server.host".to_string(),
                message: e.to_string(),
            });
        }

        if self.api_key.is_empty() {
            errors.push(ValidationError {
                field: "server.api_key".to_string(),
                message: "api key cannot be empty".to_string(),
            });
        }

        for (field, port) in [("http_port", self.http_port), ("https_port", self.https_port)] {
            if port == 0 {
                errors.push(ValidationError {
                    field: format!("server.{}", field),
                    message: "port cannot be 0".to_string(),
                });
            }
        }

        if self.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "server.timeout_secs".to_string(),
                message: "timeout must be at least 1 second".to_string(),
            });
        }

        if self.broadcast_buffer == 0 {
            errors.push(ValidationError {
                field: "server.broadcast_buffer".to_string(),
                message: "broadcast buffer cannot be 0".to_string(),
            });
        }

        errors
    }

    /// Unresolved connection parameters for this server.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.host.trim(), self.api_key.as_str())
            .with_ports(self.http_port, self.https_port)
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }

    /// Discovery settings for this server. Each probe gets the default probe
    /// timeout or the request timeout, whichever is shorter.
    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions::new()
            .http_port(self.http_port)
            .https_port(self.https_port)
            .timeout(DEFAULT_PROBE_TIMEOUT.min(Duration::from_secs(self.timeout_secs)))
    }
}

/// Poll timing in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Interval after a success.
    pub base_interval_ms: u64,
    /// Shortest allowed interval.
    pub min_interval_ms: u64,
    /// Longest allowed interval.
    pub max_interval_ms: u64,
    /// Consecutive failures before a job stops.
    pub max_retries: u32,
    /// Growth factor per consecutive failure.
    pub backoff_multiplier: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&PollConfig::default())
    }
}

impl From<&PollConfig> for PollSettings {
    fn from(config: &PollConfig) -> Self {
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            base_interval_ms: ms(config.base_interval),
            min_interval_ms: ms(config.min_interval),
            max_interval_ms: ms(config.max_interval),
            max_retries: config.max_retries,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl PollSettings {
    /// Scheduler configuration for these settings.
    pub fn to_poll_config(&self) -> PollConfig {
        PollConfig::new()
            .base_interval(Duration::from_millis(self.base_interval_ms))
            .min_interval(Duration::from_millis(self.min_interval_ms))
            .max_interval(Duration::from_millis(self.max_interval_ms))
            .max_retries(self.max_retries)
            .backoff_multiplier(self.backoff_multiplier)
    }

    /// Validate poll settings.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        match self.to_poll_config().validate() {
            Ok(()) => Vec::new(),
            Err(e) => vec![ValidationError {
                field: prefix.to_string(),
                message: e.to_string(),
            }],
        }
    }
}

/// Per-job overrides of [`PollSettings`]. Unset fields use the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl PollOverrides {
    /// Apply these overrides on top of `defaults`.
    pub fn apply(&self, defaults: &PollSettings) -> PollSettings {
        PollSettings {
            base_interval_ms: self.base_interval_ms.unwrap_or(defaults.base_interval_ms),
            min_interval_ms: self.min_interval_ms.unwrap_or(defaults.min_interval_ms),
            max_interval_ms: self.max_interval_ms.unwrap_or(defaults.max_interval_ms),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
        }
    }
}

/// A query polled on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job id.
    pub id: String,
    /// GraphQL document.
    pub query: String,
    /// Variables sent with the document.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Poll timing overrides.
    #[serde(default)]
    pub poll: PollOverrides,
}

impl JobConfig {
    /// Effective poll settings for this job.
    pub fn poll_settings(&self, defaults: &PollSettings) -> PollSettings {
        self.poll.apply(defaults)
    }

    /// Validate job configuration.
    pub fn validate(&self, prefix: &str, defaults: &PollSettings) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.id", prefix),
                message: "job id cannot be empty".to_string(),
            });
        }

        if self.query.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.query", prefix),
                message: "query cannot be empty".to_string(),
            });
        }

        errors.extend(
            self.poll_settings(defaults)
                .validate(&format!("{}.poll", prefix)),
        );

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.host` or `jobs[0].query`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unraid")
        .join("service.toml")
}
