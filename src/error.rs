//! Error types for the mapping cache

use thiserror::Error;

use crate::sg::DeviceId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the mapping cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// A bounded retry policy gave up before the operation succeeded
    #[error("{operation} did not succeed after {attempts} attempts")]
    RetryExhausted {
        operation: &'static str,
        attempts: u32,
    },

    /// Bulk teardown left mappings for the device that are still referenced
    #[error("{remaining} mapping(s) for device {device} are still referenced after sweep")]
    MappingsStillReferenced { device: DeviceId, remaining: usize },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error
    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse or encode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    /// Prometheus registry or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` for the bulk-teardown partial failure.
    pub fn is_partial_sweep(&self) -> bool {
        matches!(self, Error::MappingsStillReferenced { .. })
    }
}
