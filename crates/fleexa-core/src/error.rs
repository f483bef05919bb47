//! Error types for configuration and file loading.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML document could not be parsed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON document could not be parsed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration value is out of its accepted range.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
