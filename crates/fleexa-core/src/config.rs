//! Engine configuration.
//!
//! Values are resolved in three layers: built-in defaults, an optional
//! `fleexa.toml` file, then environment variable overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    /// Seconds an envelope timestamp may lie in the future.
    pub const SKEW_TOLERANCE_SECS: u64 = 300;
    /// Seconds during which a repeated command request id is a duplicate.
    pub const DEDUP_WINDOW_SECS: u64 = 300;
    /// Upper bound on tracked `(device_id, request_id)` pairs.
    pub const DEDUP_MAX_ENTRIES: usize = 10_000;
    /// Largest accepted inbound payload.
    pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
    /// Configuration file looked up in the working directory.
    pub const CONFIG_FILE: &str = "fleexa.toml";
}

/// Environment variable names.
pub mod env_vars {
    pub const SKEW_TOLERANCE_SECS: &str = "FLEEXA_SKEW_TOLERANCE_SECS";
    pub const DEDUP_WINDOW_SECS: &str = "FLEEXA_DEDUP_WINDOW_SECS";
    pub const DEDUP_MAX_ENTRIES: &str = "FLEEXA_DEDUP_MAX_ENTRIES";
    pub const DEVICE_TYPES: &str = "FLEEXA_DEVICE_TYPES";
    pub const MAX_PAYLOAD_BYTES: &str = "FLEEXA_MAX_PAYLOAD_BYTES";
    /// Switches the CLI to JSON log output.
    pub const LOG_JSON: &str = "FLEEXA_LOG_JSON";
}

/// Tunables of the validation and routing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum future skew of an envelope timestamp, in seconds.
    pub skew_tolerance_secs: u64,
    /// Command dedup window, in seconds.
    pub dedup_window_secs: u64,
    /// Size bound of the dedup window.
    pub dedup_max_entries: usize,
    /// Registry configuration file. Built-in device types are used when unset.
    pub device_types_path: Option<PathBuf>,
    /// Inbound payloads above this size are rejected unparsed.
    pub max_payload_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            skew_tolerance_secs: defaults::SKEW_TOLERANCE_SECS,
            dedup_window_secs: defaults::DEDUP_WINDOW_SECS,
            dedup_max_entries: defaults::DEDUP_MAX_ENTRIES,
            device_types_path: None,
            max_payload_bytes: defaults::MAX_PAYLOAD_BYTES,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path`, or from `fleexa.toml` when it exists,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!(category = "config", path = %path.display(), "Loading engine config");
                Self::from_toml_str(&std::fs::read_to_string(path)?)?
            }
            None => match read_optional(Path::new(defaults::CONFIG_FILE))? {
                Some(content) => {
                    info!(category = "config", "Loading engine config from: {}", defaults::CONFIG_FILE);
                    Self::from_toml_str(&content)?
                }
                None => Self::default(),
            },
        };

        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(env_vars::SKEW_TOLERANCE_SECS) {
            self.skew_tolerance_secs = parse_var(env_vars::SKEW_TOLERANCE_SECS, &v)?;
        }
        if let Some(v) = lookup(env_vars::DEDUP_WINDOW_SECS) {
            self.dedup_window_secs = parse_var(env_vars::DEDUP_WINDOW_SECS, &v)?;
        }
        if let Some(v) = lookup(env_vars::DEDUP_MAX_ENTRIES) {
            self.dedup_max_entries = parse_var(env_vars::DEDUP_MAX_ENTRIES, &v)?;
        }
        if let Some(v) = lookup(env_vars::MAX_PAYLOAD_BYTES) {
            self.max_payload_bytes = parse_var(env_vars::MAX_PAYLOAD_BYTES, &v)?;
        }
        if let Some(v) = lookup(env_vars::DEVICE_TYPES) {
            if !v.trim().is_empty() {
                self.device_types_path = Some(PathBuf::from(v.trim()));
            }
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.dedup_window_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "dedup_window_secs must be greater than zero".into(),
            ));
        }
        if self.dedup_max_entries == 0 {
            return Err(Error::InvalidConfiguration(
                "dedup_max_entries must be greater than zero".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(Error::InvalidConfiguration(
                "max_payload_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.skew_tolerance_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::InvalidConfiguration(format!("{} has an invalid value: '{}'", name, value))
    })
}

/// Read a file that may legitimately be absent. Any other read error is
/// returned.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
