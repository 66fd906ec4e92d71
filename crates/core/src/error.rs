//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
///
/// Every layer of the upload pipeline eventually reports one of these
/// variants so the HTTP surface can pick a status code and tell the client
/// whether a retry makes sense.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad size, name, index or payload. Not retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session expired or never existed. The client must restart.
    #[error("unknown upload session: {0}")]
    UnknownSession(String),

    /// Scratch disk read or write failed.
    #[error("i/o failure: {0}")]
    IoFailure(String),

    /// The object store could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Chunks could not be merged into the final file.
    #[error("reassembly failed: {0}")]
    ReassemblyFailed(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("metadata failure: {0}")]
    MetadataFailure(String),
}

impl Error {
    /// Whether the caller may retry the same operation without restarting the session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Stable short name used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownSession(_) => "unknown_session",
            Self::IoFailure(_) => "io_failure",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::ReassemblyFailed(_) => "reassembly_failed",
            Self::ObjectNotFound(_) => "object_not_found",
            Self::MetadataFailure(_) => "metadata_failure",
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
