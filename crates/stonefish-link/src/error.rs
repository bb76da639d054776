//! Error types for the link protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the link layer.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The codec cannot represent or parse a value. Fatal to a single
    /// send or receive, never to the connection.
    #[error("Encoding error: {0}")]
    Encoding(String),
    /// Credential or security-policy rejection.
    #[error("Authentication error: {0}")]
    Authentication(String),
    /// Malformed program, or an invoked function failed.
    #[error("Execution error: {0}")]
    Execution(String),
    /// The connection closed before the operation settled.
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Alias for link results.
pub type LinkResult<T> = Result<T, LinkError>;

impl LinkError {
    /// Shorthand for an [`LinkError::Execution`] with a formatted message.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Encoding(_) | LinkError::Json(_) | LinkError::MessageTooLarge { .. } => {
                ErrorKind::Encoding
            }
            LinkError::Authentication(_) => ErrorKind::Authentication,
            LinkError::ConnectionClosed | LinkError::Io(_) => ErrorKind::ConnectionClosed,
            LinkError::Execution(_) | LinkError::Config(_) => ErrorKind::Execution,
        }
    }

    /// Convert into the payload carried by a `Reject`.
    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            LinkError::Encoding(m)
            | LinkError::Authentication(m)
            | LinkError::Execution(m)
            | LinkError::Config(m) => m.clone(),
            other => other.to_string(),
        };
        ErrorPayload {
            kind: self.kind(),
            message,
        }
    }
}

/// Error taxonomy shared by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Encoding,
    Authentication,
    Execution,
    ConnectionClosed,
}

/// The error carried by a `Reject` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ErrorPayload> for LinkError {
    fn from(payload: ErrorPayload) -> Self {
        match payload.kind {
            ErrorKind::Encoding => LinkError::Encoding(payload.message),
            ErrorKind::Authentication => LinkError::Authentication(payload.message),
            ErrorKind::Execution => LinkError::Execution(payload.message),
            ErrorKind::ConnectionClosed => LinkError::ConnectionClosed,
        }
    }
}
