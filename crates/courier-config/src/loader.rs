//! Configuration loader with layered sources.

use crate::{AppConfig, ConfigLoadError, ConfigResult, ConfigValidator};
use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable selecting the environment overlay file.
pub const ENVIRONMENT_VAR: &str = "COURIER_ENVIRONMENT";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "COURIER";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    raw: Arc<RwLock<Config>>,
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `{dir}/default.toml` - Default values
    /// 2. `{dir}/{environment}.toml` - Environment-specific overrides
    /// 3. `{dir}/local.toml` - Local overrides (not committed)
    /// 4. Environment variables with `COURIER__` prefix and `__` separator
    pub fn new(config_dir: impl Into<String>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let raw = Self::build(&config_dir)?;
        let config = Self::decode(&raw)?;

        Ok(Self {
            raw: Arc::new(RwLock::new(raw)),
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> ConfigResult<Self> {
        Self::new("./config")
    }

    /// Returns the current application configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Deserializes a named top-level section, falling back to its default
    /// when the section is absent.
    pub async fn section<T: DeserializeOwned + Default>(&self, key: &str) -> ConfigResult<T> {
        let raw = self.raw.read().await;
        match raw.get::<T>(key) {
            Ok(value) => Ok(value),
            Err(config::ConfigError::NotFound(_)) => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reloads the configuration from disk.
    pub async fn reload(&self) -> ConfigResult<()> {
        let raw = Self::build(&self.config_dir)?;
        let config = Self::decode(&raw)?;
        *self.raw.write().await = raw;
        *self.config.write().await = config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn build(config_dir: &str) -> ConfigResult<Config> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        info!(environment = %environment, config_dir = %config_dir, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{config_dir}/{name}.toml");
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?)
    }

    fn decode(raw: &Config) -> ConfigResult<AppConfig> {
        let app_config: AppConfig = raw.clone().try_deserialize()?;

        ConfigValidator::validate(&app_config).map_err(|errors| {
            ConfigLoadError::Invalid(errors.iter().map(ToString::to_string).collect())
        })?;

        Ok(app_config)
    }
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("config_dir", &self.config_dir)
            .finish_non_exhaustive()
    }
}
