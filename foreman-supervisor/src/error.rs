//! Error types for supervisor operations

use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("A supervisor with the name [{0}] is already running")]
    Duplicate(String),

    #[error("Failed to launch worker for queue {queue}: {source}")]
    Spawn {
        queue: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal worker {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error(transparent)]
    Core(#[from] foreman_core::error::ForemanError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
