//! Tool error taxonomy and the JSON error envelope.
//!
//! Every node endpoint returns either a typed success payload or
//! `{"error":{"kind":"<enum>","message":"<string>"}}`. The kind decides the
//! HTTP status: caller mistakes map to 4xx, node faults to 5xx. Nothing in
//! this enum is fatal to the node process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error discriminator carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PathEscape,
    FileNotFound,
    IsDirectory,
    AlreadyExists,
    EncodingError,
    TooLarge,
    CommandNotAllowed,
    Timeout,
    Unauthorized,
    InvalidRequest,
    InternalError,
}

impl ErrorKind {
    /// HTTP status the envelope is sent with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::PathEscape | ErrorKind::CommandNotAllowed => 403,
            ErrorKind::FileNotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::IsDirectory | ErrorKind::EncodingError | ErrorKind::InvalidRequest => 400,
            ErrorKind::TooLarge => 413,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Timeout => 408,
            ErrorKind::InternalError => 500,
        }
    }
}

/// Typed error produced by tool handlers on the node and surfaced per-node
/// by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn path_escape(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PathEscape, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileNotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::InternalError,
        };
        Self::new(kind, err.to_string())
    }
}

/// The on-wire error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<ToolError> for ErrorEnvelope {
    fn from(err: ToolError) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind,
                message: err.message,
            },
        }
    }
}

impl From<ErrorEnvelope> for ToolError {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self {
            kind: envelope.error.kind,
            message: envelope.error.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn envelope_round_trips_kind() {
        let err = ToolError::path_escape("requested path escapes root");
        let envelope = ErrorEnvelope::from(err.clone());
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""kind":"path_escape""#));

        let parsed: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(ToolError::from(parsed), err);
    }

    #[test]
    fn caller_errors_are_4xx() {
        for kind in [
            ErrorKind::PathEscape,
            ErrorKind::FileNotFound,
            ErrorKind::IsDirectory,
            ErrorKind::AlreadyExists,
            ErrorKind::EncodingError,
            ErrorKind::TooLarge,
            ErrorKind::CommandNotAllowed,
            ErrorKind::Unauthorized,
            ErrorKind::InvalidRequest,
            ErrorKind::Timeout,
        ] {
            assert!(kind.http_status() < 500, "{kind:?} should be a caller error");
        }
        assert_eq!(ErrorKind::InternalError.http_status(), 500);
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(ToolError::from(io).kind, ErrorKind::FileNotFound);
    }
}
