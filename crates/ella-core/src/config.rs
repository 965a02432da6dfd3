//! Session configuration.
//!
//! [`SessionConfig`] is what a [`crate::ConnectionSession`] runs with.
//! [`ConfigFile`] is its TOML form, with whole seconds instead of
//! `Duration`s and a `[preferences]` section for the binding file:
//!
//! ```toml
//! [session]
//! mutex_timeout_secs = 10
//! connect_timeout_secs = 10
//! persist_timeout_secs = 5
//! event_capacity = 100
//!
//! [backoff]
//! base_interval_secs = 15
//! max_backoff_secs = 120
//! multiplier = 2.0
//! jitter = false
//!
//! [preferences]
//! path = "/home/me/.local/share/ella/bound_device.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::preferences::default_preferences_path;

/// Runtime configuration for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// How long a connect request waits for another attempt to finish.
    pub mutex_timeout: Duration,
    /// Bound on a single transport connect.
    pub connect_timeout: Duration,
    /// Bound on preferences writes during bind/unbind.
    pub persist_timeout: Duration,
    /// Reconnection backoff.
    pub backoff: BackoffPolicy,
    /// Capacity of the session event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mutex_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            persist_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            event_capacity: 100,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mutex wait bound.
    #[must_use]
    pub fn mutex_timeout(mut self, timeout: Duration) -> Self {
        self.mutex_timeout = timeout;
        self
    }

    /// Set the transport connect bound.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the preferences write bound.
    #[must_use]
    pub fn persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check timeouts and the backoff policy.
    pub fn validate(&self) -> Result<()> {
        if self.mutex_timeout.is_zero() {
            return Err(Error::invalid_config("mutex_timeout must be > 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        if self.persist_timeout.is_zero() {
            return Err(Error::invalid_config("persist_timeout must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        self.backoff.validate()
    }
}

/// TOML configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Session timeouts.
    pub session: SessionSection,
    /// Reconnection backoff.
    pub backoff: BackoffSection,
    /// Where the binding is stored.
    pub preferences: PreferencesSection,
}

impl ConfigFile {
    /// Load configuration from the default path, or defaults if absent.
    pub fn load_default() -> std::result::Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
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

    /// Validate every section, collecting all problems.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.session.validate());
        errors.extend(self.backoff.validate());
        errors.extend(self.preferences.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Runtime configuration described by this file.
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            mutex_timeout: Duration::from_secs(self.session.mutex_timeout_secs),
            connect_timeout: Duration::from_secs(self.session.connect_timeout_secs),
            persist_timeout: Duration::from_secs(self.session.persist_timeout_secs),
            backoff: BackoffPolicy {
                base_interval: Duration::from_secs(self.backoff.base_interval_secs),
                max_backoff: Duration::from_secs(self.backoff.max_backoff_secs),
                multiplier: self.backoff.multiplier,
                jitter: self.backoff.jitter,
            },
            event_capacity: self.session.event_capacity,
        }
    }

    /// Binding file path, falling back to the platform data directory.
    pub fn preferences_path(&self) -> PathBuf {
        self.preferences
            .path
            .clone()
            .unwrap_or_else(default_preferences_path)
    }
}

/// `[session]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Mutex wait bound in seconds.
    pub mutex_timeout_secs: u64,
    /// Transport connect bound in seconds.
    pub connect_timeout_secs: u64,
    /// Preferences write bound in seconds.
    pub persist_timeout_secs: u64,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            mutex_timeout_secs: 10,
            connect_timeout_secs: 10,
            persist_timeout_secs: 5,
            event_capacity: 100,
        }
    }
}

impl SessionSection {
    /// Validate session timeouts (1s - 5 minutes) and capacity.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("mutex_timeout_secs", self.mutex_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("persist_timeout_secs", self.persist_timeout_secs),
        ] {
            if !(1..=300).contains(&value) {
                errors.push(ValidationError {
                    field: format!("session.{}", field),
                    message: format!("must be between 1 and 300 seconds, got {}", value),
                });
            }
        }
        if self.event_capacity == 0 {
            errors.push(ValidationError {
                field: "session.event_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        errors
    }
}

/// `[backoff]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    /// Scheduler cadence in seconds.
    pub base_interval_secs: u64,
    /// Backoff cap in seconds.
    pub max_backoff_secs: u64,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Randomize delays by up to 10%.
    pub jitter: bool,
}

impl Default for BackoffSection {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            base_interval_secs: policy.base_interval.as_secs(),
            max_backoff_secs: policy.max_backoff.as_secs(),
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl BackoffSection {
    /// Validate backoff bounds.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.base_interval_secs == 0 {
            errors.push(ValidationError {
                field: "backoff.base_interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.max_backoff_secs < self.base_interval_secs {
            errors.push(ValidationError {
                field: "backoff.max_backoff_secs".to_string(),
                message: format!(
                    "must be >= base_interval_secs ({}), got {}",
                    self.base_interval_secs, self.max_backoff_secs
                ),
            });
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            errors.push(ValidationError {
                field: "backoff.multiplier".to_string(),
                message: format!("must be >= 1.0, got {}", self.multiplier),
            });
        }
        errors
    }
}

/// `[preferences]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesSection {
    /// Binding file; the platform data directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl PreferencesSection {
    /// Validate the preferences path.
    pub fn validate(&self) -> Vec<ValidationError> {
        match &self.path {
            Some(path) if path.as_os_str().is_empty() => vec![ValidationError {
                field: "preferences.path".to_string(),
                message: "must not be empty".to_string(),
            }],
            _ => Vec::new(),
        }
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
    /// The field path (e.g., `backoff.multiplier`).
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
        .join("ella")
        .join("config.toml")
}
