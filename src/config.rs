//! Configuration loaded with figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `INSTRUMENT_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore so that snake_case field
//! names survive:
//!
//! ```text
//! INSTRUMENT_APPLICATION__LOG_LEVEL=debug
//! INSTRUMENT_APPLICATION__PROFILE_DIR=/etc/instruments/profiles
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "beamline"
//! log_level = "info"
//!
//! [[sessions]]
//! id = "stage"
//! profile = "linear_stage"
//! transport = "serial"
//! address = "/dev/ttyUSB0"
//! baud_rate = 115200
//! default_timeout_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportKind;

/// Prefix of environment overrides; `__` separates nested keys.
pub const ENV_PREFIX: &str = "INSTRUMENT_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values loaded but are inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Options recognised when constructing a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Which transport backend to build.
    pub transport: TransportKind,
    /// Port path, VISA resource string, or native resource name.
    pub address: String,
    /// Serial line speed; ignored by other transports.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Bound on transport-level operations (open, write, native calls).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Re-sends after a read timeout. Zero disables automatic retry.
    #[serde(default)]
    pub retry_count: u32,
    /// Reply timeout for commands without their own override.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl SessionConfig {
    /// Defaults: 1 s timeouts, no retries.
    pub fn new(transport: TransportKind, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
            baud_rate: None,
            timeout_ms: default_timeout_ms(),
            retry_count: 0,
            default_timeout_ms: default_timeout_ms(),
        }
    }

    /// A serial port at `baud_rate`.
    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            baud_rate: Some(baud_rate),
            ..Self::new(TransportKind::Serial, path)
        }
    }

    /// A VISA resource such as `GPIB0::22::INSTR`.
    pub fn visa(resource: impl Into<String>) -> Self {
        Self::new(TransportKind::Visa, resource)
    }

    /// A resource opened through a vendor library.
    pub fn native(resource: impl Into<String>) -> Self {
        Self::new(TransportKind::Native, resource)
    }

    /// Set the transport-level timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reply timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the number of re-sends after a read timeout.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// `timeout_ms` as a duration.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `default_timeout_ms` as a duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Reject settings no transport could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{} session has an empty address",
                self.transport
            )));
        }
        if self.timeout_ms == 0 || self.default_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Session '{}' timeouts must be positive",
                self.address
            )));
        }
        if self.baud_rate == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "Session '{}' has baud_rate 0",
                self.address
            )));
        }
        if self.transport != TransportKind::Serial && self.baud_rate.is_some() {
            tracing::warn!(
                address = %self.address,
                transport = %self.transport,
                "baud_rate is ignored for non-serial transports"
            );
        }
        Ok(())
    }
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name for log output.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit log lines as JSON objects.
    #[serde(default)]
    pub log_json: bool,
    /// Directory of device profile documents.
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,
}

fn default_name() -> String {
    "rust-instrument".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_json: false,
            profile_dir: None,
        }
    }
}

/// A named session in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDefinition {
    /// Unique session identifier
    pub id: String,
    /// Device kind to look up in the profile registry.
    #[serde(default)]
    pub profile: Option<String>,
    /// Transport and timing options.
    #[serde(flatten)]
    pub session: SessionConfig,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Application-wide options.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sessions to open at start-up.
    #[serde(default)]
    pub sessions: Vec<SessionDefinition>,
}

impl CoreConfig {
    /// Load from `config/instrument.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/instrument.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(prefix).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::string(document))
            .extract()
            .map_err(ConfigError::LoadError)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Session IDs are unique and non-empty
    /// - Each session's options are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let mut ids = std::collections::HashSet::new();
        for definition in &self.sessions {
            if definition.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Session with empty id".to_string(),
                ));
            }
            if !ids.insert(&definition.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate session ID: '{}'",
                    definition.id
                )));
            }
            definition.session.validate().map_err(|e| match e {
                ConfigError::ValidationError(msg) => {
                    ConfigError::ValidationError(format!("{}: {msg}", definition.id))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Look up a session definition by id.
    pub fn session(&self, id: &str) -> Option<&SessionDefinition> {
        self.sessions.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "bench"
log_level = "debug"

[[sessions]]
id = "stage"
profile = "linear_stage"
transport = "serial"
address = "/dev/ttyUSB0"
baud_rate = 115200
default_timeout_ms = 500
retry_count = 1

[[sessions]]
id = "meter"
transport = "visa"
address = "USB0::0x1313::0x8078::P0005003::INSTR"
"#;

    #[test]
    fn test_parse_sessions() {
        let config = CoreConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "bench");

        let stage = config.session("stage").unwrap();
        assert_eq!(stage.profile.as_deref(), Some("linear_stage"));
        assert_eq!(stage.session.transport, TransportKind::Serial);
        assert_eq!(stage.session.baud_rate, Some(115200));
        assert_eq!(stage.session.default_timeout(), Duration::from_millis(500));
        assert_eq!(stage.session.retry_count, 1);

        let meter = config.session("meter").unwrap();
        assert_eq!(meter.session.retry_count, 0);
        assert_eq!(meter.session.timeout_ms, 1000);
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert!(config.sessions.is_empty());
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let err = CoreConfig::from_toml_str("[application]\nlog_level = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let doc = r#"
[[sessions]]
id = "a"
transport = "serial"
address = "COM1"

[[sessions]]
id = "a"
transport = "serial"
address = "COM2"
"#;
        let err = CoreConfig::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("Duplicate session ID"));
    }

    #[test]
    fn test_rejects_unknown_transport() {
        let doc = "[[sessions]]\nid = \"x\"\ntransport = \"carrier_pigeon\"\naddress = \"roof\"\n";
        assert!(matches!(
            CoreConfig::from_toml_str(doc),
            Err(ConfigError::LoadError(_))
        ));
    }

    #[test]
    fn test_session_validation() {
        assert!(SessionConfig::serial("COM1", 9600).validate().is_ok());
        assert!(SessionConfig::serial("  ", 9600).validate().is_err());
        assert!(SessionConfig::serial("COM1", 0).validate().is_err());
        assert!(SessionConfig::visa("GPIB0::1::INSTR")
            .with_default_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let prefix = "INSTRUMENT_CONFIG_TEST_";
        std::env::set_var(format!("{prefix}APPLICATION__LOG_LEVEL"), "warn");
        let config = CoreConfig::load_with_prefix(file.path(), prefix).unwrap();
        std::env::remove_var(format!("{prefix}APPLICATION__LOG_LEVEL"));

        assert_eq!(config.application.log_level, "warn");
        assert_eq!(config.application.name, "bench");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            CoreConfig::load_with_prefix(dir.path().join("absent.toml"), "INSTRUMENT_ABSENT_TEST_")
                .unwrap();
        assert_eq!(config, CoreConfig::default());
    }
}
