//! Configuration error type.

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigLoadError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// A source could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Source(#[from] config::ConfigError),

    /// The loaded configuration failed validation.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// Logging could not be initialised.
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}
