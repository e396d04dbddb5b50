//! Logging initialization.
//!
//! `RUST_LOG` wins over the configured level when it is set.

use crate::{ConfigLoadError, ConfigResult, LogFormat, ObservabilityConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Builds the default filter directive for a configured level.
fn default_directive(level: &str) -> String {
    format!("{},courier=debug", level.to_lowercase())
}

/// Installs the global tracing subscriber.
///
/// Fails if a subscriber has already been installed.
pub fn init_logging(config: &ObservabilityConfig) -> ConfigResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));

    let result = match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.log_target),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(config.log_target))
            .try_init(),
    };

    result.map_err(|e| ConfigLoadError::Telemetry(e.to_string()))?;

    tracing::info!(
        level = %config.log_level,
        format = ?config.log_format,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("WARN"), "warn,courier=debug");
    }

    #[test]
    fn test_second_init_fails() {
        let config = ObservabilityConfig::default();
        let _ = init_logging(&config);
        assert!(matches!(
            init_logging(&config),
            Err(ConfigLoadError::Telemetry(_))
        ));
    }
}
