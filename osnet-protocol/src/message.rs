//! Message types and request/reply bodies.
//!
//! Control messages (handshake, info, notices, stream open, errors) carry JSON
//! bodies. Stream data messages carry compact big-endian binary bodies so that
//! read/write payloads are not inflated by an encoding step.

use crate::error::{ErrorCode, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// First code available to application-defined message types.
pub const CUSTOM_TYPE_BASE: u16 = 0x1000;

/// Message type tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Session management
    Hello,
    Ping,
    Bye,
    Info,
    Notice,

    // Remote streams
    StreamTest,
    StreamOpen,
    StreamRead,
    StreamWrite,
    StreamSeek,
    StreamInfo,
    StreamClose,

    /// Application-defined message (code >= `CUSTOM_TYPE_BASE`).
    Custom(u16),
}

impl MessageType {
    /// Returns the wire code for this message type.
    pub fn code(&self) -> u16 {
        match self {
            MessageType::Hello => 1,
            MessageType::Ping => 2,
            MessageType::Bye => 3,
            MessageType::Info => 4,
            MessageType::Notice => 5,
            MessageType::StreamTest => 16,
            MessageType::StreamOpen => 17,
            MessageType::StreamRead => 18,
            MessageType::StreamWrite => 19,
            MessageType::StreamSeek => 20,
            MessageType::StreamInfo => 21,
            MessageType::StreamClose => 22,
            MessageType::Custom(code) => *code,
        }
    }

    /// Parses a wire code. Unassigned codes below `CUSTOM_TYPE_BASE` are rejected.
    pub fn from_code(code: u16) -> Result<Self, ProtocolError> {
        let msg_type = match code {
            1 => MessageType::Hello,
            2 => MessageType::Ping,
            3 => MessageType::Bye,
            4 => MessageType::Info,
            5 => MessageType::Notice,
            16 => MessageType::StreamTest,
            17 => MessageType::StreamOpen,
            18 => MessageType::StreamRead,
            19 => MessageType::StreamWrite,
            20 => MessageType::StreamSeek,
            21 => MessageType::StreamInfo,
            22 => MessageType::StreamClose,
            c if c >= CUSTOM_TYPE_BASE => MessageType::Custom(c),
            c => return Err(ProtocolError::UnknownMessageType(c)),
        };
        Ok(msg_type)
    }

    /// Creates a custom message type, rejecting codes in the reserved range.
    pub fn custom(code: u16) -> Result<Self, ProtocolError> {
        if code < CUSTOM_TYPE_BASE {
            return Err(ProtocolError::UnknownMessageType(code));
        }
        Ok(MessageType::Custom(code))
    }

    /// Returns the stable name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Ping => "PING",
            MessageType::Bye => "BYE",
            MessageType::Info => "INFO",
            MessageType::Notice => "NOTICE",
            MessageType::StreamTest => "STREAM_TEST",
            MessageType::StreamOpen => "STREAM_OPEN",
            MessageType::StreamRead => "STREAM_READ",
            MessageType::StreamWrite => "STREAM_WRITE",
            MessageType::StreamSeek => "STREAM_SEEK",
            MessageType::StreamInfo => "STREAM_INFO",
            MessageType::StreamClose => "STREAM_CLOSE",
            MessageType::Custom(_) => "CUSTOM",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Custom(code) => write!(f, "CUSTOM({:#06x})", code),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// JSON bodies
// ============================================================================

/// Serializes a value as a JSON payload.
pub fn to_json_payload<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserializes a JSON payload.
pub fn from_json_payload<T: serde::de::DeserializeOwned>(
    payload: &[u8],
) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Error details carried by a reply with the ERROR flag set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    /// Whether this error is retryable.
    pub retryable: bool,

    /// Additional error details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Parameters for HELLO request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Result for HELLO reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub server_name: String,
    pub server_version: String,
    pub session_id: String,
}

/// Result for INFO reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResult {
    pub server_name: String,
    pub server_version: String,
    pub protocol_version: u16,
    pub max_payload_bytes: u32,
    pub max_read_chunk: u32,
    pub open_handles: usize,
}

/// Kind of a server-initiated notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// The server is shutting down; the connection will close.
    Shutdown,
    /// The session was idle for too long; the connection will close.
    IdleTimeout,
    /// Free-form message.
    Message,
}

/// Body of a NOTICE push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

/// How a remote stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Existing resource, read only.
    Read,
    /// Existing resource, write only.
    Write,
    /// Existing resource, read and write.
    ReadWrite,
    /// Read and write; creates the resource or truncates it.
    Create,
}

impl OpenMode {
    pub fn readable(&self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite | OpenMode::Create)
    }

    pub fn writable(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite | OpenMode::Create)
    }
}

/// Operations permitted on a stream handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    pub seekable: bool,
}

impl Capabilities {
    pub fn read_only() -> Self {
        Self {
            readable: true,
            writable: false,
            seekable: true,
        }
    }

    pub fn from_mode(mode: OpenMode, seekable: bool) -> Self {
        Self {
            readable: mode.readable(),
            writable: mode.writable(),
            seekable,
        }
    }
}

/// Parameters for STREAM_OPEN request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenParams {
    pub locator: String,
    pub mode: OpenMode,
}

/// Describes an open stream handle (STREAM_OPEN and STREAM_INFO replies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub handle_id: u32,
    pub capabilities: Capabilities,
    pub length: u64,
    pub position: u64,
}

// ============================================================================
// Binary bodies
// ============================================================================

/// A message body with a compact binary encoding.
pub trait WireBody: Sized {
    fn encode(&self) -> Bytes;
    fn decode(payload: &[u8]) -> Result<Self, ProtocolError>;
}

fn ensure(buf: &[u8], len: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::MalformedBody(what));
    }
    Ok(())
}

/// Reference to a handle (STREAM_INFO, STREAM_CLOSE requests, STREAM_TEST reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRef {
    pub handle_id: u32,
}

impl WireBody for HandleRef {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.handle_id.to_be_bytes())
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 4 {
            return Err(ProtocolError::MalformedBody("handle reference"));
        }
        let mut buf = payload;
        Ok(Self {
            handle_id: buf.get_u32(),
        })
    }
}

/// STREAM_READ request: up to `len` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub handle_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl WireBody for ReadRequest {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(self.handle_id);
        buf.put_u64(self.offset);
        buf.put_u32(self.len);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        ensure(buf, 16, "read request")?;
        Ok(Self {
            handle_id: buf.get_u32(),
            offset: buf.get_u64(),
            len: buf.get_u32(),
        })
    }
}

/// STREAM_WRITE request: `data` written at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub handle_id: u32,
    pub offset: u64,
    pub data: Bytes,
}

impl WireBody for WriteRequest {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.data.len());
        buf.put_u32(self.handle_id);
        buf.put_u64(self.offset);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        ensure(buf, 12, "write request")?;
        let handle_id = buf.get_u32();
        let offset = buf.get_u64();
        Ok(Self {
            handle_id,
            offset,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

/// STREAM_WRITE reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub written: u32,
}

impl WireBody for WriteResult {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.written.to_be_bytes())
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 4 {
            return Err(ProtocolError::MalformedBody("write result"));
        }
        let mut buf = payload;
        Ok(Self {
            written: buf.get_u32(),
        })
    }
}

/// Reference point for a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

impl SeekOrigin {
    fn to_u8(self) -> u8 {
        match self {
            SeekOrigin::Start => 0,
            SeekOrigin::Current => 1,
            SeekOrigin::End => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(SeekOrigin::Start),
            1 => Ok(SeekOrigin::Current),
            2 => Ok(SeekOrigin::End),
            _ => Err(ProtocolError::MalformedBody("seek origin")),
        }
    }
}

/// STREAM_SEEK request.
///
/// `Current` is resolved against `position`, the caller's view of the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub handle_id: u32,
    pub origin: SeekOrigin,
    pub offset: i64,
    pub position: u64,
}

impl WireBody for SeekRequest {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(21);
        buf.put_u32(self.handle_id);
        buf.put_u8(self.origin.to_u8());
        buf.put_i64(self.offset);
        buf.put_u64(self.position);
        buf.freeze()
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        ensure(buf, 21, "seek request")?;
        Ok(Self {
            handle_id: buf.get_u32(),
            origin: SeekOrigin::from_u8(buf.get_u8())?,
            offset: buf.get_i64(),
            position: buf.get_u64(),
        })
    }
}

/// STREAM_SEEK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekResult {
    pub position: u64,
}

impl WireBody for SeekResult {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.position.to_be_bytes())
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 8 {
            return Err(ProtocolError::MalformedBody("seek result"));
        }
        let mut buf = payload;
        Ok(Self {
            position: buf.get_u64(),
        })
    }
}
