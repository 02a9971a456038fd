//! Error types for civitdl core

use thiserror::Error;

/// Errors that can occur in civitdl core
#[derive(Debug, Error)]
pub enum CivitdlError {
    /// Timeouts, dropped connections, rate limiting and 5xx responses
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The asset is gone or we are not allowed to fetch it
    #[error("Source error: {status} - {message}")]
    PermanentSource { status: u16, message: String },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("State store error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition for {id}: {message}")]
    InvalidState { id: String, message: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("A download run is already in progress")]
    RunInProgress,

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Coarse classification that drives retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    PermanentSource,
    Integrity,
    Storage,
    Filesystem,
    Cancelled,
    Other,
}

impl CivitdlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CivitdlError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            CivitdlError::PermanentSource { .. } | CivitdlError::NotFound(_) => {
                ErrorKind::PermanentSource
            }
            CivitdlError::Integrity(_) => ErrorKind::Integrity,
            CivitdlError::Storage(_) => ErrorKind::Storage,
            CivitdlError::Filesystem(_) => ErrorKind::Filesystem,
            CivitdlError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }

    /// Check if another attempt at the same asset may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::Integrity | ErrorKind::Filesystem
        )
    }

    /// Errors that abort the whole run instead of a single asset
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage)
    }

    /// Map an HTTP status code to the error taxonomy
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status == 408 || status >= 500 {
            CivitdlError::TransientNetwork(format!("HTTP {}: {}", status, message))
        } else {
            CivitdlError::PermanentSource { status, message }
        }
    }
}

impl From<reqwest::Error> for CivitdlError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => CivitdlError::from_status(status.as_u16(), error.to_string()),
            None if error.is_decode() => CivitdlError::Serialization(error.to_string()),
            None if error.is_builder() => CivitdlError::InvalidUrl(error.to_string()),
            None => CivitdlError::TransientNetwork(error.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for CivitdlError {
    fn from(error: tokio::task::JoinError) -> Self {
        CivitdlError::Task(error.to_string())
    }
}

impl From<serde_json::Error> for CivitdlError {
    fn from(error: serde_json::Error) -> Self {
        CivitdlError::Serialization(error.to_string())
    }
}
