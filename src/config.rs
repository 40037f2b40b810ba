//! Finder configuration and config file resolution.
//!
//! Resolution order:
//! 1. Explicit path (the `--config` flag)
//! 2. `<config dir>/nearcull/config.toml` if it exists
//! 3. Compiled defaults

use crate::core::duplicate::ClusterConfig;
use crate::core::results::CacheConfig;
use crate::core::scanner::ScanConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    pub scan: ScanConfig,
    pub cluster: ClusterConfig,
    pub cache: CacheConfig,
}

impl FinderConfig {
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match default_config_path() {
            Some(path) if path.exists() => {
                log::debug!("Loading config from {:?}", path);
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cluster = &self.cluster;
        if !(cluster.exact_threshold.is_finite() && cluster.exact_threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "exact_threshold must be a non-negative number, got {}",
                cluster.exact_threshold
            )));
        }
        if !cluster.similar_threshold.is_finite()
            || cluster.similar_threshold < cluster.exact_threshold
        {
            return Err(ConfigError::Invalid(format!(
                "similar_threshold ({}) must not be below exact_threshold ({})",
                cluster.similar_threshold, cluster.exact_threshold
            )));
        }
        if cluster.max_group_size < 2 {
            return Err(ConfigError::Invalid(
                "max_group_size must be at least 2".to_string(),
            ));
        }
        if self.scan.batch_size == 0 || self.scan.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "batch_size and concurrency must be positive".to_string(),
            ));
        }
        if self.scan.thumbnail_size == 0 {
            return Err(ConfigError::Invalid(
                "thumbnail_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<config dir>/nearcull/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nearcull").join("config.toml"))
}
