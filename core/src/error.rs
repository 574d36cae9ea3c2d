//! Error types for the MemoBase client.
//!
//! # Design
//! Failures are split by where they happen. `Transport` means no response
//! was obtained at all. `Http` covers a non-2xx response whose body is not an
//! envelope, so the raw status and body are kept for debugging. `Protocol`
//! means a response arrived but was malformed or lacked a required field.
//! `Domain` is the server speaking: a well-formed envelope with a non-zero
//! `errno`. `Config` is raised at construction, before any network activity.

use crate::transport::TransportError;

/// `errno` the server uses for missing resources.
pub const ERRNO_NOT_FOUND: i64 = 404;

/// Errors returned by `MemoBaseClient` and `UserHandle` operations.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The client could not be configured, e.g. no API key was supplied.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport failed before a response was obtained.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server returned a non-2xx status with a body that is not an envelope.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response was malformed or missing a required field.
    #[error("malformed server response: {0}")]
    Protocol(String),

    /// The server reported an error through the envelope.
    #[error("server error {errno}: {errmsg}")]
    Domain { errno: i64, errmsg: String },

    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A blob is missing a field its type requires.
    #[error("invalid blob: {0}")]
    InvalidBlob(String),

    /// The request could not be composed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Server-supplied error code, for `Domain` failures.
    pub fn errno(&self) -> Option<i64> {
        match self {
            ApiError::Domain { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// True when the server said the addressed resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ApiError::Domain { errno, .. } => *errno == ERRNO_NOT_FOUND,
            ApiError::Http { status, .. } => *status == 404,
            _ => false,
        }
    }
}
