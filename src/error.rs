//! Error types for the cache layer
//!
//! Provides unified error handling using thiserror.

use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Boxed native error attached to [`CacheError::Backend`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// == Cache Error Enum ==
/// Unified error type shared by every cache driver.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Bad key, namespace, TTL or option shape
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Key already present and overwrite was not allowed
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    /// Key missing or expired
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Counter operation on a value that is not a number
    #[error("Value is not numeric: {0}")]
    NotNumeric(String),

    /// Value cannot be represented by the storage codec
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Backend handle or required option is missing
    #[error("Driver not configured: {0}")]
    DriverNotConfigured(String),

    /// Backend connection is down
    #[error("Driver not connected: {0}")]
    DriverNotConnected(String),

    /// Operation the backend cannot honour
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Native backend failure, original cause attached
    #[error("Backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: BoxError,
    },
}

impl CacheError {
    /// Wraps a native backend error.
    pub fn backend<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        CacheError::Backend {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Returns true for failures that `silent` options turn into fallbacks.
    pub fn is_silenceable(&self) -> bool {
        matches!(self, CacheError::KeyNotFound(_) | CacheError::NotNumeric(_))
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            CacheError::DuplicateEntry(_) => StatusCode::CONFLICT,
            CacheError::InvalidArgument(_)
            | CacheError::NotNumeric(_)
            | CacheError::Serialization(_)
            | CacheError::Parse(_) => StatusCode::BAD_REQUEST,
            CacheError::UnsupportedOperation(_) => StatusCode::NOT_IMPLEMENTED,
            CacheError::DriverNotConfigured(_) | CacheError::DriverNotConnected(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CacheError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache layer.
pub type Result<T> = std::result::Result<T, CacheError>;
