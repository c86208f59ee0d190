//! Configuration loading for the routenet CLI

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use routenet_train::{ModelConfig, SyntheticConfig, TrainingConfig};

/// Name of the configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "routenet.toml";

/// Full CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub training: TrainingConfig,
    pub model: ModelConfig,
    pub data: SyntheticConfig,
}

impl Config {
    /// Load from the first config file found (or `explicit`) and
    /// `ROUTENET__`-prefixed environment variables.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let config_path = match explicit {
            Some(path) if !path.exists() => {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_config_file(),
        };

        let mut builder = ConfigBuilder::<config::builder::DefaultState>::default();

        if let Some(path) = &config_path {
            tracing::info!("Loading config from: {:?}", path);
            builder = builder.add_source(File::from(path.clone()).required(false));
        } else {
            tracing::info!("No config file found, using defaults");
        }

        builder = builder.add_source(
            Environment::with_prefix("ROUTENET")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config
            .training
            .validate()
            .context("Invalid [training] section")?;
        Ok((config, config_path))
    }

    /// Check in order: ROUTENET_CONFIG env, ./routenet.toml,
    /// ~/.config/routenet/routenet.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ROUTENET_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config").join("routenet").join(CONFIG_FILE);
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
