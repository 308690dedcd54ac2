//! Cache configuration
//!
//! Configuration is plain data: build it in code, or load it from a YAML or
//! JSON file.
//!
//! ```yaml
//! alloc_retry:
//!   max_attempts: null      # retry until success
//!   sleep_after_spin_us: 50
//! map_retry:
//!   max_attempts: 10000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Configuration for a [`MappingCache`](crate::MappingCache).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Retry policy for bookkeeping record allocation
    pub alloc_retry: RetryPolicy,
    /// Retry policy for the platform map primitive
    pub map_retry: RetryPolicy,
}

impl CacheConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, choosing the format by extension (`.json`, else YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.alloc_retry
            .validate()
            .map_err(|e| Error::Config(format!("alloc_retry: {}", e)))?;
        self.map_retry
            .validate()
            .map_err(|e| Error::Config(format!("map_retry: {}", e)))?;
        Ok(())
    }
}
