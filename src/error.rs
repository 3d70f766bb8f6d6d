//! Error taxonomy shared by the cache, file handles and the session layer.

use thiserror::Error;

/// Errors surfaced to callers of the store client.
///
/// `BackendUnavailable` is retryable by the caller; everything else is
/// terminal for the call that produced it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("object is sealed")]
    AlreadySealed,

    #[error("handle is not writable")]
    NotWritable,

    #[error("handle is closed")]
    ClosedHandle,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
