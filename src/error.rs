//! Error Module
//!
//! Defines the error taxonomy of the cache server and how each error is
//! reported to HTTP clients.

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the cache server
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Request path is not `[prefix/](ac|cas)/<sha256>`. Holds the escaped path.
    #[error("Resource name must be a SHA256 hash in hex. Got '{0}'.")]
    MalformedKey(String),

    #[error("Content-Length header is required.")]
    MissingContentLength,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Holds the escaped method name.
    #[error("Method '{0}' not supported.")]
    UnsupportedMethod(String),

    #[error("Hashes don't match. Provided '{expected}', Actual '{actual}'.")]
    HashMismatch { expected: String, actual: String },

    #[error("Transfer error: {0}")]
    TransferFailure(String),

    #[error("Persist error: {0}")]
    PersistFailure(String),

    #[error("The disk is full. File could not be uploaded.")]
    InsufficientSpace,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CacheError {
    /// HTTP status reported to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            CacheError::MalformedKey(_) | CacheError::MissingContentLength => {
                StatusCode::BAD_REQUEST
            }
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            CacheError::InsufficientSpace => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error is an unexpected server condition that belongs in the
    /// error log. Client mistakes and misses are routine traffic.
    pub fn is_unexpected(&self) -> bool {
        !matches!(
            self,
            CacheError::MalformedKey(_)
                | CacheError::MissingContentLength
                | CacheError::NotFound(_)
                | CacheError::UnsupportedMethod(_)
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for CacheError {
    fn from(err: hyper::Error) -> Self {
        CacheError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type alias for the cache server
pub type Result<T> = std::result::Result<T, CacheError>;
