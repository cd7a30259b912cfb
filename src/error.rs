//! Error types for the session memory store

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Coarse classification every error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyExists,
    BackendUnavailable,
}

#[derive(Error, Debug)]
pub enum MemoryError {

    // =============================
    // Store Errors
    // =============================

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::InvalidInput(_) | MemoryError::SerializationError(_) => {
                ErrorKind::InvalidInput
            }
            MemoryError::NotFound(_) => ErrorKind::NotFound,
            MemoryError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            MemoryError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
        }
    }

    /// Only transient infrastructure faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::BackendUnavailable
    }
}

/// Transport failures and transient server states are outages; any other
/// reply (WRONGTYPE, a value that fails to convert) is a request the server
/// will keep rejecting.
impl From<redis::RedisError> for MemoryError {
    fn from(err: redis::RedisError) -> Self {
        let transient = err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || matches!(
                err.kind(),
                redis::ErrorKind::BusyLoadingError
                    | redis::ErrorKind::TryAgain
                    | redis::ErrorKind::ClusterDown
                    | redis::ErrorKind::MasterDown
                    | redis::ErrorKind::AuthenticationFailed
                    | redis::ErrorKind::InvalidClientConfig
            );

        if transient {
            MemoryError::BackendUnavailable(err.to_string())
        } else {
            MemoryError::InvalidInput(err.to_string())
        }
    }
}
