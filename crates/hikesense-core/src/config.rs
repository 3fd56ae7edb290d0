//! Application configuration management.
//!
//! Handles loading, saving, and validating HikeSense configuration including:
//! - The sensor to pair with and its GATT identifiers
//! - Heart rate alert thresholds and the alert throttle interval
//! - The account backend and directions service endpoints
//! - The local daemon's listen address and log output
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `HIKESENSE__SECTION__KEY` environment variables.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::bluetooth::{
    LinkConfig, DEFAULT_READING_BUFFER, HEART_RATE_CHARACTERISTIC_UUID, HEART_RATE_SERVICE_UUID,
    SENSOR_NAME,
};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "HIKESENSE_CONFIG";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "HIKESENSE";

/// Travel modes the directions service accepts.
pub const TRAVEL_MODES: [&str; 4] = ["walking", "bicycling", "driving", "transit"];

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No config directory could be determined for this platform.
    #[error("Cannot determine config directory")]
    NoConfigDir,

    /// Layered loading failed (unreadable file, bad TOML, wrong types).
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// The config file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// Target path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path, e.g. `alerts.window`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration errors: {}", .0.len(), join_errors(.0))]
    MultipleValidationErrors(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load(err.to_string())
    }
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HikeSenseConfig {
    /// Sensor pairing.
    pub device: DeviceConfig,

    /// Heart rate alerting.
    pub alerts: AlertConfig,

    /// Account backend.
    pub backend: BackendConfig,

    /// Directions service.
    pub directions: DirectionsConfig,

    /// Local daemon.
    pub server: ServerConfig,
}

/// `[device]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Advertised name of the sensor.
    pub name: String,

    /// Heart rate GATT service.
    pub service_uuid: Uuid,

    /// Heart rate GATT characteristic.
    pub characteristic_uuid: Uuid,

    /// Upper bound on one discovery pass.
    pub discovery_timeout_secs: u64,

    /// Decoded readings buffered ahead of the pipeline.
    pub reading_buffer: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: SENSOR_NAME.to_string(),
            service_uuid: HEART_RATE_SERVICE_UUID,
            characteristic_uuid: HEART_RATE_CHARACTERISTIC_UUID,
            discovery_timeout_secs: 30,
            reading_buffer: DEFAULT_READING_BUFFER,
        }
    }
}

impl DeviceConfig {
    /// Settings for a [`DeviceLink`](crate::bluetooth::DeviceLink).
    #[must_use]
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            device_name: self.name.clone(),
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            reading_buffer: self.reading_buffer,
        }
    }
}

/// `[alerts]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Number of consecutive readings that must all be abnormal.
    pub window: usize,

    /// Readings strictly above this are high.
    pub high_bpm: u16,

    /// Readings strictly below this are low.
    pub low_bpm: u16,

    /// Minimum gap between alert dispatch attempts.
    pub throttle_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window: 5,
            high_bpm: 200,
            low_bpm: 40,
            throttle_ms: 600_000,
        }
    }
}

/// `[backend]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the account service.
    pub base_url: String,

    /// Bearer token. Usually handed over by the UI after login.
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            token: None,
            timeout_secs: 15,
        }
    }
}

/// `[directions]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionsConfig {
    /// Base URL of the directions API.
    pub base_url: String,

    /// API key.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Travel mode.
    pub mode: String,
}

impl Default for DirectionsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://maps.googleapis.com".to_string(),
            api_key: None,
            mode: "walking".to_string(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: String,

    /// Port to listen on.
    pub port: u16,

    /// JSON file logging instead of pretty console output.
    pub production: bool,

    /// Filter directive used when neither `RUST_LOG` nor
    /// `HIKESENSE_LOG_LEVEL` is set.
    pub log_level: String,

    /// Where production log files go. Defaults to a platform directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3000,
            production: false,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl HikeSenseConfig {
    /// Load configuration from the default location plus environment.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or parsed, or if the
    /// result fails validation.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path()?;
        Self::load_from(Some(&path))
    }

    /// Load configuration from `path` (if given and present) plus
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_from(path: Option<&Path>) -> ConfigResult<Self> {
        Self::layered(path, None)
    }

    fn layered(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> ConfigResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`. Secrets are not written.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let write_error = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_error)
    }

    /// Get the configuration file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] if neither `HIKESENSE_CONFIG` is
    /// set nor a home directory is known.
    pub fn config_path() -> ConfigResult<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dirs = directories::ProjectDirs::from("dev", "hikesense", "hikesense")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns the single failing field, or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: String| {
            if !ok {
                errors.push(ConfigError::ValidationError {
                    field: field.to_string(),
                    message,
                });
            }
        };

        check(
            !self.device.name.trim().is_empty(),
            "device.name",
            "must not be empty".to_string(),
        );
        check(
            self.device.discovery_timeout_secs > 0,
            "device.discovery_timeout_secs",
            "must be greater than zero".to_string(),
        );
        check(
            self.device.reading_buffer > 0,
            "device.reading_buffer",
            "must be greater than zero".to_string(),
        );
        check(
            self.alerts.window > 0,
            "alerts.window",
            "must be at least 1".to_string(),
        );
        check(
            self.alerts.low_bpm < self.alerts.high_bpm,
            "alerts.low_bpm",
            format!(
                "must be below alerts.high_bpm ({} >= {})",
                self.alerts.low_bpm, self.alerts.high_bpm
            ),
        );
        check(
            is_http_url(&self.backend.base_url),
            "backend.base_url",
            format!("'{}' is not an http(s) URL", self.backend.base_url),
        );
        check(
            self.backend.timeout_secs > 0,
            "backend.timeout_secs",
            "must be greater than zero".to_string(),
        );
        check(
            is_http_url(&self.directions.base_url),
            "directions.base_url",
            format!("'{}' is not an http(s) URL", self.directions.base_url),
        );
        check(
            TRAVEL_MODES.contains(&self.directions.mode.as_str()),
            "directions.mode",
            format!(
                "'{}' is not one of {}",
                self.directions.mode,
                TRAVEL_MODES.join(", ")
            ),
        );
        check(
            self.server.bind_address.parse::<IpAddr>().is_ok(),
            "server.bind_address",
            format!("'{}' is not an IP address", self.server.bind_address),
        );
        check(
            !self.server.log_level.trim().is_empty(),
            "server.log_level",
            "must not be empty".to_string(),
        );

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Whether `value` parses as an absolute http or https URL.
#[must_use]
pub fn is_http_url(value: &str) -> bool {
    url::Url::parse(value).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HikeSenseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alerts.window, 5);
        assert_eq!(config.alerts.throttle_ms, 600_000);
        assert_eq!(config.device.name, "HikeSenseBLE");
        assert_eq!(
            config.device.link_config().discovery_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_layered_load_without_file() {
        let config = HikeSenseConfig::layered(None, env(&[])).unwrap();
        assert_eq!(config, HikeSenseConfig::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[device]
discovery_timeout_secs = 10

[alerts]
high_bpm = 180
"#,
        )
        .unwrap();

        let config = HikeSenseConfig::layered(Some(&path), env(&[])).unwrap();
        assert_eq!(config.device.discovery_timeout_secs, 10);
        assert_eq!(config.alerts.high_bpm, 180);
        assert_eq!(config.alerts.low_bpm, 40);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(HikeSenseConfig::layered(Some(&path), env(&[])).is_ok());
    }

    #[test]
    fn test_log_settings_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
production = true
log_level = "hikesense_core=debug,info"
log_dir = "/srv/hikesense/logs"
"#,
        )
        .unwrap();

        let config = HikeSenseConfig::layered(Some(&path), env(&[])).unwrap();
        assert!(config.server.production);
        assert_eq!(config.server.log_level, "hikesense_core=debug,info");
        assert_eq!(
            config.server.log_dir.as_deref(),
            Some(Path::new("/srv/hikesense/logs"))
        );

        let mut blank = config;
        blank.server.log_level = " ".to_string();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = HikeSenseConfig::layered(
            None,
            env(&[
                ("HIKESENSE__BACKEND__TOKEN", "secret-token"),
                ("HIKESENSE__SERVER__PORT", "4100"),
            ]),
        )
        .unwrap();
        assert_eq!(config.backend.token.as_deref(), Some("secret-token"));
        assert_eq!(config.server.port, 4100);
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = HikeSenseConfig::default();
        config.alerts.window = 0;
        config.alerts.low_bpm = 250;
        config.directions.mode = "teleport".to_string();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => {
                assert_eq!(errors.len(), 3);
                let text = ConfigError::MultipleValidationErrors(errors).to_string();
                assert!(text.contains("alerts.window"));
                assert!(text.contains("directions.mode"));
            }
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error() {
        let mut config = HikeSenseConfig::default();
        config.backend.base_url = "ftp://example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "backend.base_url"
        ));
    }

    #[test]
    fn test_save_omits_secrets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = HikeSenseConfig::default();
        config.backend.token = Some("secret-token".to_string());
        config.directions.api_key = Some("maps-key".to_string());
        config.server.port = 3100;
        config.save_to(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("secret-token"));
        assert!(!written.contains("maps-key"));

        let reloaded = HikeSenseConfig::layered(Some(&path), env(&[])).unwrap();
        assert_eq!(reloaded.server.port, 3100);
        assert_eq!(reloaded.backend.token, None);
    }
}
