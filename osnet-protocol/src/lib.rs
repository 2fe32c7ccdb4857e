//! # osnet-protocol
//!
//! Wire protocol for osnet.
//!
//! This crate provides:
//! - Binary framing with message type, correlation id, length prefix and CRC32C
//! - The message type registry shared by client and server
//! - Typed request/reply bodies (JSON for control messages, binary for stream data)
//! - Error codes and protocol constants

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    Capabilities, ErrorBody, MessageType, OpenMode, SeekOrigin, StreamDescriptor, WireBody,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the osnet server.
pub const DEFAULT_PORT: u16 = 7420;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
