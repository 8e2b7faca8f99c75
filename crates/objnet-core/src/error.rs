use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical error type exposed by the core primitives.
#[derive(Debug, Error)]
pub enum ObjnetError {
    /// Malformed identifier, range, salt or other user-supplied text.
    #[error("invalid {what}: {reason}")]
    Format { what: &'static str, reason: String },

    /// The remote service could not be reached or dropped the stream.
    #[error("connection error: {0}")]
    Connection(String),

    /// Handshake echo mismatch, unexpected frame or response length mismatch.
    #[error("protocol integrity violation: {0}")]
    ProtocolIntegrity(String),

    /// Explicit failure status returned by the remote service.
    #[error("remote rejected request: {0}")]
    Remote(Status),

    /// Local source/sink failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Object failed signature or checksum verification.
    #[error("object corrupted: {0}")]
    Corrupted(String),

    /// Misuse of the homomorphic hash helpers.
    #[error("hash error: {0}")]
    Hash(&'static str),

    /// Signing or key material failure.
    #[error("signature error: {0}")]
    Signature(String),

    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

impl ObjnetError {
    pub(crate) fn format(what: &'static str, reason: impl fmt::Display) -> Self {
        ObjnetError::Format {
            what,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        ObjnetError::ProtocolIntegrity(reason.into())
    }
}

impl From<Status> for ObjnetError {
    fn from(status: Status) -> Self {
        ObjnetError::Remote(status)
    }
}

/// Status codes a service attaches to a rejected request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    OutOfRange,
    Aborted,
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::InvalidArgument => "InvalidArgument",
            StatusCode::NotFound => "NotFound",
            StatusCode::PermissionDenied => "PermissionDenied",
            StatusCode::FailedPrecondition => "FailedPrecondition",
            StatusCode::OutOfRange => "OutOfRange",
            StatusCode::Aborted => "Aborted",
            StatusCode::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Failure status carried back over a stream, code plus service message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PermissionDenied, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

pub type Result<T, E = ObjnetError> = std::result::Result<T, E>;
