//! Provider Configuration
//!
//! Settings for one session-state provider instance. Loadable from a TOML file
//! or from the name/value pairs a hosting framework hands to the provider.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{SessionResult, SessionStateError};
use crate::reaper::{validate_polling_interval, DEFAULT_POLLING_INTERVAL_SECS};
use crate::store::MAX_APPLICATION_NAME_LEN;

pub const KEY_SESSION_TYPE: &str = "sessionType";
pub const KEY_DATABASE: &str = "database";
pub const KEY_COMPRESSION: &str = "compression";
pub const KEY_POLLING_INTERVAL: &str = "pollingInterval";

/// Typed access to a provider's raw name/value settings
#[derive(Debug, Clone, Default)]
pub struct ConfigReader {
    /// Owner reported in error messages
    owner: String,
    values: HashMap<String, String>,
}

impl ConfigReader {
    pub fn new(owner: impl Into<String>, values: HashMap<String, String>) -> Self {
        Self {
            owner: owner.into(),
            values,
        }
    }

    fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Present and not blank
    fn filled(&self, key: &str) -> Option<&str> {
        self.raw(key).map(str::trim).filter(|v| !v.is_empty())
    }

    fn invalid(&self, message: String) -> SessionStateError {
        SessionStateError::Configuration(format!("{}: {}", self.owner, message))
    }

    /// `"true"` (any case) or `"1"` is true; any other value is false.
    /// A blank value counts as missing.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.filled(key) {
            Some(value) => value.eq_ignore_ascii_case("true") || value == "1",
            None => default,
        }
    }

    pub fn get_i32(&self, key: &str, default: i32) -> SessionResult<i32> {
        match self.filled(key) {
            None => Ok(default),
            Some(value) => value.parse::<i32>().map_err(|_| {
                self.invalid(format!("the value '{}' of '{}' is not a valid integer", value, key))
            }),
        }
    }

    /// Required string setting, trimmed
    pub fn get_string(&self, key: &str, allow_empty: bool) -> SessionResult<String> {
        let value = self
            .raw(key)
            .ok_or_else(|| self.invalid(format!("the setting '{}' is required", key)))?
            .trim();
        if !allow_empty && value.is_empty() {
            return Err(self.invalid(format!("the setting '{}' cannot be empty", key)));
        }
        Ok(value.to_string())
    }

    /// Optional string setting; a blank value falls back to `default` unless `allow_empty`
    pub fn get_string_or(&self, key: &str, default: &str, allow_empty: bool) -> String {
        match self.raw(key) {
            None => default.to_string(),
            Some(value) if !allow_empty && value.trim().is_empty() => default.to_string(),
            Some(value) => value.to_string(),
        }
    }

    /// Whole seconds; negative values are rejected, blank counts as missing
    pub fn get_duration_secs(&self, key: &str, default: Duration) -> SessionResult<Duration> {
        let Some(raw) = self.filled(key) else {
            return Ok(default);
        };
        let secs = self.get_i32(key, 0)?;
        u64::try_from(secs)
            .map(Duration::from_secs)
            .map_err(|_| self.invalid(format!("the value '{}' of '{}' cannot be negative", raw, key)))
    }
}

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_SECS
}

/// Settings for one provider instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Application the sessions are partitioned under
    pub application_name: String,
    /// SQLite database path
    pub database: String,
    /// Compress stored payloads
    #[serde(default)]
    pub compression: bool,
    /// Seconds between expiration sweeps (1..=120)
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
}

impl ProviderConfig {
    pub fn new(application_name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            database: database.into(),
            compression: false,
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
        }
    }

    /// Build from hosting-framework name/value settings
    pub fn from_values(reader: &ConfigReader) -> SessionResult<Self> {
        let interval = reader.get_duration_secs(
            KEY_POLLING_INTERVAL,
            Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS),
        )?;

        let config = Self {
            application_name: reader.get_string(KEY_SESSION_TYPE, true)?,
            database: reader.get_string(KEY_DATABASE, false)?,
            compression: reader.get_bool(KEY_COMPRESSION, false),
            polling_interval_secs: interval.as_secs(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> SessionResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionStateError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("Loading provider configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.application_name.chars().count() > MAX_APPLICATION_NAME_LEN {
            return Err(SessionStateError::Configuration(format!(
                "application name exceeds {} characters",
                MAX_APPLICATION_NAME_LEN
            )));
        }
        if self.database.trim().is_empty() {
            return Err(SessionStateError::Configuration("database cannot be empty".into()));
        }
        validate_polling_interval(self.polling_interval_secs)?;
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}
