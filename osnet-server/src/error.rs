//! Server error types.

use osnet_protocol::{ErrorBody, ErrorCode, MessageType};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] osnet_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    #[error("handshake required before {0}")]
    HandshakeRequired(MessageType),

    #[error("no handler for message type {0}")]
    UnknownMessageType(MessageType),

    #[error("handle {0} is not open")]
    UnknownHandle(u32),

    #[error("handle {handle_id} does not permit {operation}")]
    CapabilityDenied {
        handle_id: u32,
        operation: &'static str,
    },

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    #[error("session already holds {limit} open handles")]
    HandleLimit { limit: usize },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::HandshakeRequired(_) => ErrorCode::BadRequest,
            ServerError::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
            ServerError::UnknownHandle(_) => ErrorCode::UnknownHandle,
            ServerError::CapabilityDenied { .. } => ErrorCode::CapabilityDenied,
            ServerError::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
            ServerError::InvalidSeek(_) => ErrorCode::InvalidSeek,
            ServerError::HandleLimit { .. } => ErrorCode::HandleLimit,
            ServerError::Handler(_) => ErrorCode::InternalError,
            ServerError::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    /// Builds the body of an error reply.
    pub fn to_error_body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.error_code(), self.to_string());
        match self {
            ServerError::UnknownHandle(handle_id) => body.with_detail("handle_id", *handle_id),
            ServerError::CapabilityDenied {
                handle_id,
                operation,
            } => body
                .with_detail("handle_id", *handle_id)
                .with_detail("operation", *operation),
            ServerError::HandleLimit { limit } => body.with_detail("limit", *limit),
            _ => body,
        }
    }
}
