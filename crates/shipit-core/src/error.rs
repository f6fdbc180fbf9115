//! Error types for shipit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("runtime mismatch: {0}")]
    RuntimeMismatch(String),

    #[error("dependency resolution failed: {0}")]
    DependencyResolution(String),

    #[error("archive failed: {0}")]
    Archive(String),

    #[error("credential exchange failed: {0}")]
    CredentialExchange(String),

    #[error("deployment rejected: {0}")]
    DeploymentRejected(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
