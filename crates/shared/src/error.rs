use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Durable I/O failed. Retry with backoff; never drop the pending write.
    StorageFault,
    /// Transport unavailable. The caller decides between retrying and queueing.
    NotConnected,
    /// Referenced message id is absent. Not retried.
    NotFound,
    /// No authenticated session yet.
    NotAuthenticated,
    Validation,
}

impl ErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::StorageFault | ErrorCode::NotConnected)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct SyncError {
    pub code: ErrorCode,
    pub message: String,
}

impl SyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn storage_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageFault, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotConnected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn not_authenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotAuthenticated, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }
}
