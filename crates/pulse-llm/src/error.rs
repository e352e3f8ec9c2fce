//! Error types for the LLM runtime integration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the runtime
    #[error("{} failed: status {}{}", .operation, .status, body_suffix(.body))]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sidecar error: {0}")]
    Sidecar(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(", body: {}", body)
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

impl LlmError {
    pub fn status(operation: &'static str, status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        LlmError::Status {
            operation,
            status: status.as_u16(),
            body: body.into(),
        }
    }

    pub fn sidecar(msg: impl Into<String>) -> Self {
        LlmError::Sidecar(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            LlmError::Timeout(_) => true,
            LlmError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<LlmError> for pulse_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            e if e.is_timeout() => pulse_core::Error::Timeout(e.to_string()),
            LlmError::Serialization(e) => pulse_core::Error::Serialization(e),
            LlmError::Io(e) => pulse_core::Error::Io(e),
            other => pulse_core::Error::External(other.to_string()),
        }
    }
}
