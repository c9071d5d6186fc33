//! Error types for the usage registry

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Usage registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid report envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: missing scope {scope}")]
    Forbidden { scope: String },

    #[error("Usage queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Usage lookup exceeded {timeout_ms}ms")]
    UsageLookupTimeout { timeout_ms: u64 },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid validation settings: {0}")]
    InvalidSettings(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("Semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl RegistryError {
    /// Whether the caller (or the consumer's retry loop) should try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::QueueUnavailable(_)
                | RegistryError::TransientStore(_)
                | RegistryError::UsageLookupTimeout { .. }
        )
    }
}
