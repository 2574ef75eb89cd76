//! Configuration management with environment variable support.
//!
//! ## Environment Variables
//!
//! - `CRYPTMETA_KEY_PATH`: Override metadata key file path
//! - `CRYPTMETA_METADATA_PATH`: Override encrypted metadata file path
//! - `CRYPTMETA_CONFIG`: Override config file path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

pub const ENV_KEY_PATH: &str = "CRYPTMETA_KEY_PATH";
pub const ENV_METADATA_PATH: &str = "CRYPTMETA_METADATA_PATH";
pub const ENV_CONFIG_PATH: &str = "CRYPTMETA_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub key_path: String,
    pub metadata_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_path: "./cryptmeta.key".to_string(),
            metadata_path: "./metadata.enc".to_string(),
        }
    }
}

impl Config {
    pub fn new(key_path: impl Into<String>, metadata_path: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            metadata_path: metadata_path.into(),
        }
    }

    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                Self::read_file(p)?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key_path) = env::var(ENV_KEY_PATH) {
            debug!(key_path = %key_path, "overriding key_path from environment");
            self.key_path = key_path;
        }

        if let Ok(metadata_path) = env::var(ENV_METADATA_PATH) {
            debug!(metadata_path = %metadata_path, "overriding metadata_path from environment");
            self.metadata_path = metadata_path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_path.trim().is_empty() {
            anyhow::bail!("key_path cannot be empty");
        }

        if self.metadata_path.trim().is_empty() {
            anyhow::bail!("metadata_path cannot be empty");
        }

        if self.key_path == self.metadata_path {
            anyhow::bail!("key_path and metadata_path must differ");
        }

        let key_path = Path::new(&self.key_path);
        if let Some(parent) = key_path.parent() {
            let parent_str = parent.to_string_lossy().to_lowercase();
            if parent_str.contains("public") || parent_str.contains("www") {
                warn!(
                    path = %self.key_path,
                    "key file path appears to be in a public directory"
                );
            }
        }

        Ok(())
    }
}
