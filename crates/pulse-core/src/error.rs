//! Error types for the Pulse AI control plane

use thiserror::Error;

/// Main error type shared by every Pulse AI crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A collaborator was not wired or refused the request (budget, disabled feature)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// LLM runtime or child process misbehaved
    #[error("External error: {0}")]
    External(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn canceled(msg: impl Into<String>) -> Self {
        Error::Canceled(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Error::External(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for deadline expiry, which callers treat as warn-and-skip
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinct_from_cancel() {
        let t = Error::timeout("analysis");
        let c = Error::canceled("shutdown");
        assert!(t.is_timeout());
        assert!(!t.is_canceled());
        assert!(c.is_canceled());
        assert!(!c.is_timeout());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::not_found("guest").to_string(), "Not found: guest");
        assert_eq!(
            Error::unavailable("patrol skipped: budget").to_string(),
            "Unavailable: patrol skipped: budget"
        );
    }
}
