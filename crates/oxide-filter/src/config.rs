//! Configuration for filter limits and backend resources.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Limits and pool settings shared by both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Deepest include tree accepted and serialized.
    pub max_include_depth: usize,
    /// Most relationship hops a relational filter path may take.
    pub max_join_hops: usize,
    /// Limit used by the catalog when only `skip` is given.
    pub max_entities: u64,
    /// Number of catalog client handles kept in the pool.
    pub client_pool_size: usize,
    /// How long a request waits for a free client handle.
    pub pool_acquire_timeout_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_include_depth: 4,
            max_join_hops: 2,
            max_entities: 10_000,
            client_pool_size: 4,
            pool_acquire_timeout_ms: 5_000,
        }
    }
}

impl FilterConfig {
    /// Parses a configuration from JSON; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no store can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_pool_size == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "client_pool_size",
                message: "the pool needs at least one client".to_string(),
            });
        }
        Ok(())
    }

    /// Loads a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Returns the pool acquire timeout.
    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }
}
