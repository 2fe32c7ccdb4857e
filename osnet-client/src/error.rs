//! Client error types.

use osnet_protocol::{ErrorBody, ErrorCode};
use std::io;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] osnet_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("correlation id {0} is already pending")]
    DuplicateCorrelation(u32),

    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    #[error("operation not permitted: {0}")]
    Capability(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("stream is closed")]
    StreamClosed,

    #[error("server error: {code} - {message}")]
    ServerError {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
}

impl ClientError {
    /// Returns whether this error is retryable.
    ///
    /// Nothing in the client retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout => true,
            ClientError::ServerError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns whether this error means the whole connection is unusable.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Protocol(_) | ClientError::ConnectionClosed
        )
    }
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        match body.code {
            ErrorCode::UnknownHandle => ClientError::UnknownHandle(body.message),
            ErrorCode::CapabilityDenied => ClientError::Capability(body.message),
            ErrorCode::ResourceUnavailable => ClientError::ResourceUnavailable(body.message),
            code => ClientError::ServerError {
                code,
                message: body.message,
                retryable: body.retryable,
            },
        }
    }
}

impl From<ClientError> for io::Error {
    fn from(err: ClientError) -> Self {
        let kind = match &err {
            ClientError::Io(e) => e.kind(),
            ClientError::Timeout => io::ErrorKind::TimedOut,
            ClientError::ConnectionClosed => io::ErrorKind::ConnectionAborted,
            ClientError::UnknownHandle(_) | ClientError::ResourceUnavailable(_) => {
                io::ErrorKind::NotFound
            }
            ClientError::Capability(_) => io::ErrorKind::PermissionDenied,
            ClientError::StreamClosed => io::ErrorKind::BrokenPipe,
            ClientError::ServerError {
                code: ErrorCode::InvalidSeek,
                ..
            } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
