//! Configuration types for Foreman

use crate::error::{ForemanError, Result};
use crate::options::SupervisorOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main configuration for Foreman
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForemanConfig {
    /// Command queue and repository backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Supervisors keyed by name
    #[serde(default)]
    pub supervisors: BTreeMap<String, SupervisorOptions>,
}

/// Redis backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix applied to every key Foreman writes
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

fn default_store_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_store_prefix() -> String {
    "foreman:".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            prefix: default_store_prefix(),
        }
    }
}

impl ForemanConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (foreman.toml)
    /// 3. Environment variable overrides (`FOREMAN_STORE__URL=...`)
    /// 4. The file named by FOREMAN_CONFIG_PATH, if set
    ///
    /// # Errors
    ///
    /// Returns an error if configuration file is invalid or fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ForemanConfig::default()))
            .merge(Toml::file("foreman.toml"))
            .merge(Env::prefixed("FOREMAN_").split("__"));

        if let Ok(path) = std::env::var("FOREMAN_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ForemanConfig = figment.extract().map_err(|e| {
            ForemanError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.finish()
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let config: ForemanConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                ForemanError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.finish()
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let config: ForemanConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| {
                ForemanError::Configuration(format!("Failed to parse configuration: {}", e))
            })?;

        config.finish()
    }

    /// Options for the supervisor called `name`
    pub fn supervisor(&self, name: &str) -> Result<SupervisorOptions> {
        self.supervisors.get(name).cloned().ok_or_else(|| {
            ForemanError::Configuration(format!("No supervisor named {} is configured", name))
        })
    }

    /// Validate every configured supervisor
    pub fn validate(&self) -> Result<()> {
        if self.store.url.trim().is_empty() {
            return Err(ForemanError::Configuration(
                "store.url must not be empty".to_string(),
            ));
        }

        for options in self.supervisors.values() {
            options.validate()?;
        }

        Ok(())
    }

    // Map keys are the supervisor names
    fn finish(mut self) -> Result<Self> {
        for (name, options) in self.supervisors.iter_mut() {
            options.name = name.clone();
        }
        self.validate()?;
        Ok(self)
    }
}
