//! Error types for objmeta
//!
//! This module defines the common error taxonomy shared by the cache, the
//! persistent store, the metadata service and the archival client.

use crate::types::BucketNameError;
use thiserror::Error;

/// Common result type for objmeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for objmeta
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    // Caller errors
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(#[from] BucketNameError),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    // Backend / transport errors
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a cache transport error
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// A timeout is retryable for reads, but for accounting writes it is
    /// ambiguous: the remote side may already have applied the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::ServiceUnavailable(_)
                | Self::ConnectionFailed(_)
                | Self::Cache(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BucketNotFound(_) | Self::UserNotFound(_) | Self::NotFound(_)
        )
    }

    /// Check if the outcome of the failed operation is unknown
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Get HTTP status code for S3 API compatibility
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidParameter(_) | Self::MissingParameter(_) | Self::InvalidBucketName(_) => {
                400
            }

            // 404 Not Found
            Self::BucketNotFound(_) | Self::UserNotFound(_) | Self::NotFound(_) => 404,

            // 429 Too Many Requests
            Self::LimitExceeded(_) => 429,

            // 500 Internal Server Error
            Self::Internal(_)
            | Self::Serialization(_)
            | Self::Deserialization(_)
            | Self::Configuration(_) => 500,

            // 503 Service Unavailable
            Self::ServiceUnavailable(_)
            | Self::Timeout(_)
            | Self::ConnectionFailed(_)
            | Self::Cache(_)
            | Self::Storage(_) => 503,
        }
    }

    /// Get S3 error code for API compatibility
    #[must_use]
    pub const fn s3_error_code(&self) -> &'static str {
        match self {
            Self::BucketNotFound(_) => "NoSuchBucket",
            Self::UserNotFound(_) | Self::NotFound(_) => "ResourceNotFound",
            Self::InvalidBucketName(_) => "InvalidBucketName",
            Self::InvalidParameter(_) => "InvalidParameterValue",
            Self::MissingParameter(_) => "MissingParameterValue",
            Self::LimitExceeded(_) => "LimitExceeded",
            Self::ServiceUnavailable(_)
            | Self::Timeout(_)
            | Self::ConnectionFailed(_)
            | Self::Cache(_)
            | Self::Storage(_) => "ServiceUnavailable",
            _ => "InternalError",
        }
    }
}
