//! Console configuration using Figment.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `RFCONSOLE_`, nested keys separated
//!    by a double underscore
//! 2. TOML configuration file (default: `config/rf_console.toml`)
//!
//! Every section has defaults, so a missing or empty file yields a usable
//! configuration.
//!
//! # Environment Variables
//!
//! ```text
//! RFCONSOLE_APPLICATION__LOG_LEVEL=debug
//! RFCONSOLE_BACKEND__BASE_URL=http://10.0.0.5:5000
//! RFCONSOLE_TIMING__RECONCILE_INTERVAL_MS=2000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rf_console::config::ConsoleConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConsoleConfig::load()?;
//!     println!("Backend: {}", config.backend.base_url);
//!     Ok(())
//! }
//! ```

use crate::measurement::MeasurementConfig;
use crate::protocol::VnaDevice;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rf_console.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level console configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub application: ApplicationConfig,
    pub backend: BackendConfig,
    pub timing: TimingConfig,
    /// Operator defaults for new measurement runs
    pub measurement: MeasurementConfig,
    pub matrix: MatrixConfig,
    pub vna: VnaConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "RF Console".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Backend device-control service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Upper bound for every backend request
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Background loop periods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub reconcile_interval_ms: u64,
    pub measurement_poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 5000,
            measurement_poll_interval_ms: 800,
        }
    }
}

impl TimingConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn measurement_poll_interval(&self) -> Duration {
        Duration::from_millis(self.measurement_poll_interval_ms)
    }
}

/// Switch-matrix connection defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub default_host: String,
    pub default_port: u16,
    pub default_baud_rate: u32,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            default_host: "192.168.2.11".to_string(),
            default_port: 5025,
            default_baud_rate: 115_200,
        }
    }
}

/// VNA connection defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VnaConfig {
    /// Device id, e.g. `rohde-zna26`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_device: Option<String>,
    pub default_host: String,
    pub default_port: u16,
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self {
            default_device: None,
            default_host: "192.168.1.100".to_string(),
            default_port: 5025,
        }
    }
}

impl VnaConfig {
    /// The configured default device, if any.
    pub fn device(&self) -> Result<Option<VnaDevice>, ConfigError> {
        self.default_device
            .as_deref()
            .map(|id| {
                id.parse::<VnaDevice>()
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))
            })
            .transpose()
    }
}

impl ConsoleConfig {
    /// Load configuration from the default file and environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if loading or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RFCONSOLE_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Backend URL is http(s) and the timeout is non-zero
    /// - Loop intervals are non-zero
    /// - Default measurement settings are valid
    /// - Default VNA device id is known
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let url = self.backend.base_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid backend base_url '{url}'. Must start with http:// or https://"
            )));
        }
        if self.backend.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "backend.request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.timing.reconcile_interval_ms == 0 || self.timing.measurement_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timing intervals must be greater than 0".to_string(),
            ));
        }

        if let Err(errors) = self.measurement.validate() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid measurement defaults: {errors}"
            )));
        }

        if self.matrix.default_port == 0 || self.vna.default_port == 0 {
            return Err(ConfigError::ValidationError(
                "default ports must be greater than 0".to_string(),
            ));
        }

        self.vna.device()?;
        Ok(())
    }

    /// Render as TOML, e.g. to seed a config file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}
