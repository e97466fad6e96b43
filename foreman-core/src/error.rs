//! Error types for Foreman operations

/// Result type for Foreman operations
pub type Result<T> = std::result::Result<T, ForemanError>;

/// Error types shared by supervisors, stores, and tooling
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Supervisor record or command was malformed
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Storage backend error (Redis)
    #[error("Storage error: {0}")]
    Storage(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for ForemanError {
    fn from(s: String) -> Self {
        ForemanError::Other(s)
    }
}

impl From<&str> for ForemanError {
    fn from(s: &str) -> Self {
        ForemanError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ForemanError {
    fn from(err: anyhow::Error) -> Self {
        ForemanError::Other(err.to_string())
    }
}
