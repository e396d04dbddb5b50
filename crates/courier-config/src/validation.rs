//! Configuration validation module.
//!
//! Every check runs and every failure is collected.

use crate::AppConfig;
use std::fmt;
use std::net::SocketAddr;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Pool size configuration is invalid (min must be <= max).
    InvalidPoolSize { min: u32, max: u32 },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: u32, maximum: u32 },
    /// Timeout value must be positive.
    NonPositiveTimeout { name: String },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Socket address does not parse.
    InvalidAddress { name: String, value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {url_type} URL: {message}")
            }
            Self::InvalidPoolSize { min, max } => {
                write!(
                    f,
                    "Invalid pool size: min ({min}) cannot be greater than max ({max})"
                )
            }
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {value} exceeds maximum allowed ({maximum})")
            }
            Self::NonPositiveTimeout { name } => {
                write!(f, "Timeout '{name}' must be positive")
            }
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{value}' (valid: trace, debug, info, warn, error)"
                )
            }
            Self::InvalidAddress { name, value } => {
                write!(f, "Invalid address for '{name}': '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: u32 = 1000;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_database(&config.database, &mut errors);
        Self::validate_redis(&config.redis, &mut errors);
        Self::validate_observability(&config.observability, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_database(config: &crate::DatabaseConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.url.is_empty() {
            errors.push(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        } else if !config.url.starts_with("mysql://") {
            errors.push(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL must start with mysql://".to_string(),
            });
        }

        if config.min_connections > config.max_connections {
            errors.push(ConfigValidationError::InvalidPoolSize {
                min: config.min_connections,
                max: config.max_connections,
            });
        }
        if config.max_connections > Self::MAX_POOL_SIZE {
            errors.push(ConfigValidationError::PoolSizeTooLarge {
                value: config.max_connections,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        if config.connect_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "database.connect_timeout_secs".to_string(),
            });
        }
    }

    fn validate_redis(config: &crate::RedisConfig, errors: &mut Vec<ConfigValidationError>) {
        if !config.enabled {
            return;
        }

        match Url::parse(&config.url) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss") => {}
            Ok(_) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: "URL must start with redis:// or rediss://".to_string(),
            }),
            Err(e) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            }),
        }

        if config.pool_size > Self::MAX_POOL_SIZE {
            errors.push(ConfigValidationError::PoolSizeTooLarge {
                value: config.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }
    }

    fn validate_observability(
        config: &crate::ObservabilityConfig,
        errors: &mut Vec<ConfigValidationError>,
    ) {
        let level = config.log_level.to_lowercase();
        if !Self::VALID_LOG_LEVELS.contains(&level.as_str()) {
            errors.push(ConfigValidationError::InvalidLogLevel {
                value: config.log_level.clone(),
            });
        }

        if config.metrics_enabled && config.metrics_addr.parse::<SocketAddr>().is_err() {
            errors.push(ConfigValidationError::InvalidAddress {
                name: "observability.metrics_addr".to_string(),
                value: config.metrics_addr.clone(),
            });
        }
    }
}
