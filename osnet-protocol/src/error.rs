//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while framing or decoding message bodies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'OSNX', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("unknown message type: {0:#06x}")]
    UnknownMessageType(u16),

    #[error("truncated frame: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("payload length mismatch: header declares {declared} bytes, {available} available")]
    LengthMismatch { declared: usize, available: usize },

    #[error("malformed {0} body")]
    MalformedBody(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes carried in error replies.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    BadRequest,
    UnknownMessageType,

    // Stream errors
    UnknownHandle,
    CapabilityDenied,
    ResourceUnavailable,
    InvalidSeek,
    HandleLimit,

    // System errors
    InternalError,
    ShuttingDown,
}

impl ErrorCode {
    /// Returns whether a caller may reasonably try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::HandleLimit | ErrorCode::InternalError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::UnsupportedProtocol => write!(f, "UNSUPPORTED_PROTOCOL"),
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::UnknownMessageType => write!(f, "UNKNOWN_MESSAGE_TYPE"),
            ErrorCode::UnknownHandle => write!(f, "UNKNOWN_HANDLE"),
            ErrorCode::CapabilityDenied => write!(f, "CAPABILITY_DENIED"),
            ErrorCode::ResourceUnavailable => write!(f, "RESOURCE_UNAVAILABLE"),
            ErrorCode::InvalidSeek => write!(f, "INVALID_SEEK"),
            ErrorCode::HandleLimit => write!(f, "HANDLE_LIMIT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::ShuttingDown => write!(f, "SHUTTING_DOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::HandleLimit.is_retryable());
        assert!(ErrorCode::InternalError.is_retryable());

        // Remote I/O failures are reported, not retried
        assert!(!ErrorCode::UnknownHandle.is_retryable());
        assert!(!ErrorCode::CapabilityDenied.is_retryable());
        assert!(!ErrorCode::ResourceUnavailable.is_retryable());
        assert!(!ErrorCode::InvalidSeek.is_retryable());
        assert!(!ErrorCode::BadRequest.is_retryable());
        assert!(!ErrorCode::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_error_code_display_matches_serde() {
        for code in [
            ErrorCode::UnsupportedProtocol,
            ErrorCode::BadRequest,
            ErrorCode::UnknownMessageType,
            ErrorCode::UnknownHandle,
            ErrorCode::CapabilityDenied,
            ErrorCode::ResourceUnavailable,
            ErrorCode::InvalidSeek,
            ErrorCode::HandleLimit,
            ErrorCode::InternalError,
            ErrorCode::ShuttingDown,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }

    #[test]
    fn test_error_code_serialization() {
        let parsed: ErrorCode = serde_json::from_str("\"UNKNOWN_HANDLE\"").unwrap();
        assert_eq!(parsed, ErrorCode::UnknownHandle);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidMagic(*b"XXXX");
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::Truncated { needed: 10 };
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::LengthMismatch {
            declared: 8,
            available: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains('8') && msg.contains("12"));

        let err = ProtocolError::UnknownMessageType(0x00ff);
        assert!(err.to_string().contains("0x00ff"));

        let err = ProtocolError::MalformedBody("read request");
        assert!(err.to_string().contains("read request"));
    }
}
