//! Archival service errors

use objmeta_common::Error;
use thiserror::Error;
use tracing::warn;

pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Errors surfaced by an archival retrieval service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
    #[error("archive resource not found: {0}")]
    NotFound(String),

    #[error("archive limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("invalid archive parameter: {0}")]
    InvalidParameter(String),

    #[error("missing archive parameter: {0}")]
    MissingParameter(String),

    #[error("archive service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("archive service internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Map a remote error code to the taxonomy.
    ///
    /// Codes without a mapping are logged and reported as internal errors.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "ResourceNotFoundException" => Self::NotFound(message),
            "PolicyEnforcedException" => Self::LimitExceeded(message),
            "InvalidParameterValueException" => Self::InvalidParameter(message),
            "MissingParameterValueException" => Self::MissingParameter(message),
            "InsufficientCapacityException" => Self::Internal(message),
            "ServiceUnavailableException" => Self::ServiceUnavailable(message),
            other => {
                warn!(code = other, message = %message, "unmapped archive service error");
                Self::Internal(format!("{other}: {message}"))
            }
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_))
    }
}

impl From<reqwest::Error> for ArchiveError {
    fn from(e: reqwest::Error) -> Self {
        Self::ServiceUnavailable(e.to_string())
    }
}

impl From<ArchiveError> for Error {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::NotFound(msg) => Self::NotFound(msg),
            ArchiveError::LimitExceeded(msg) => Self::LimitExceeded(msg),
            ArchiveError::InvalidParameter(msg) => Self::InvalidParameter(msg),
            ArchiveError::MissingParameter(msg) => Self::MissingParameter(msg),
            ArchiveError::ServiceUnavailable(msg) => Self::ServiceUnavailable(msg),
            ArchiveError::Internal(msg) => Self::Internal(msg),
        }
    }
}
