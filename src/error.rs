//! Error types for the Historical Datastore
//!
//! A single process-wide taxonomy that maps onto HTTP status codes at the
//! API boundary. Components return these directly; the handler layer only
//! translates them into `{code, message}` bodies.

use thiserror::Error;

/// Main error type for the Historical Datastore
#[derive(Error, Debug)]
pub enum Error {
    /// No such entity
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Validation failure: type mismatch, bad duration, malformed payload
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Wrong content type
    #[error("unsupported media type: {0}")]
    Unsupported(String),

    /// Transient downstream failure (broker or storage engine), retriable
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code this error maps to at the API boundary
    pub fn status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::BadRequest(_) => 400,
            Error::Unsupported(_) => 415,
            Error::Unavailable(_) => 503,
            Error::Internal(_) => 500,
        }
    }

    /// True for `NotFound`, used by callers that treat absence as a
    /// non-fatal condition (e.g. the broker message path).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {e}"))
    }
}

impl From<heed::Error> for Error {
    fn from(e: heed::Error) -> Self {
        Error::Internal(format!("registry store error: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::Unavailable(format!("storage engine unreachable: {e}"))
        } else {
            Error::Internal(format!("storage engine request error: {e}"))
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
