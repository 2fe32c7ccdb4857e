//! Binary frame format.
//!
//! Frame layout (22 bytes header + payload), all integers big-endian:
//!
//! ```text
//! +--------+---------+--------+----------+----------------+-------------+--------+
//! | magic  | version | flags  | msg_type | correlation_id | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes | 2 bytes  |    4 bytes     |   4 bytes   | 4 bytes|
//! +--------+---------+--------+----------+----------------+-------------+--------+
//! | payload (payload_len bytes)                                                  |
//! +------------------------------------------------------------------------------+
//! ```

use crate::error::ProtocolError;
use crate::message::{to_json_payload, ErrorBody, MessageType};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying osnet frames: "OSNX"
pub const MAGIC: [u8; 4] = *b"OSNX";

/// Size of the fixed frame header in bytes (4+2+2+2+4+4+4 = 22).
pub const FRAME_HEADER_SIZE: usize = 22;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Frame is a reply to the request with the same correlation id.
    pub const REPLY: u16 = 1 << 1;
    /// Reply carries an `ErrorBody` instead of a result.
    pub const ERROR: u16 = 1 << 2;
    /// Server-initiated frame with no matching request.
    pub const PUSH: u16 = 1 << 3;
    /// Request that must not be answered.
    pub const NO_REPLY: u16 = 1 << 4;

    /// Valid flags mask for protocol version 1.
    const VALID_V1_MASK: u16 = 0x001F;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_reply(mut self) -> Self {
        self.0 |= Self::REPLY;
        self
    }

    pub fn with_error(mut self) -> Self {
        self.0 |= Self::ERROR;
        self
    }

    pub fn with_push(mut self) -> Self {
        self.0 |= Self::PUSH;
        self
    }

    pub fn with_no_reply(mut self) -> Self {
        self.0 |= Self::NO_REPLY;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_reply(&self) -> bool {
        self.0 & Self::REPLY != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn is_push(&self) -> bool {
        self.0 & Self::PUSH != 0
    }

    pub fn is_no_reply(&self) -> bool {
        self.0 & Self::NO_REPLY != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed frame: the message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version.
    pub version: u16,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Message type tag.
    pub msg_type: MessageType,
    /// Correlation id echoed by the reply. Zero for pushes.
    pub correlation_id: u32,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a request frame.
    pub fn new(msg_type: MessageType, correlation_id: u32, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            msg_type,
            correlation_id,
            payload,
        }
    }

    /// Creates a successful reply to a request.
    pub fn reply(msg_type: MessageType, correlation_id: u32, payload: Bytes) -> Self {
        let mut frame = Self::new(msg_type, correlation_id, payload);
        frame.flags = frame.flags.with_reply();
        frame
    }

    /// Creates an error reply to a request.
    pub fn error(
        msg_type: MessageType,
        correlation_id: u32,
        error: &ErrorBody,
    ) -> Result<Self, ProtocolError> {
        let mut frame = Self::new(msg_type, correlation_id, to_json_payload(error)?);
        frame.flags = frame.flags.with_reply().with_error();
        Ok(frame)
    }

    /// Creates a server-initiated frame.
    pub fn push(msg_type: MessageType, payload: Bytes) -> Self {
        let mut frame = Self::new(msg_type, 0, payload);
        frame.flags = frame.flags.with_push();
        frame
    }

    /// Creates a request frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(
        msg_type: MessageType,
        correlation_id: u32,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(msg_type, correlation_id, to_json_payload(value)?))
    }

    /// Returns the total encoded size of this frame.
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload_len = self.payload.len() as u32;

        let mut buf = BytesMut::with_capacity(self.wire_size());

        // Magic (4 bytes)
        buf.put_slice(&MAGIC);

        // Version (2 bytes)
        buf.put_u16(self.version);

        // Flags (2 bytes)
        buf.put_u16(self.flags.bits());

        // Message type (2 bytes)
        buf.put_u16(self.msg_type.code());

        // Correlation id (4 bytes)
        buf.put_u32(self.correlation_id);

        // Payload length (4 bytes)
        buf.put_u32(payload_len);

        // CRC32C of payload (4 bytes)
        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);

        // Payload
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from a stream buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded and consumed,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header = Header::parse(&buf[..FRAME_HEADER_SIZE])?;

        let total_len = FRAME_HEADER_SIZE + header.payload_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        // Consume header
        buf.advance(FRAME_HEADER_SIZE);

        // Read payload
        let payload = buf.split_to(header.payload_len).freeze();

        header.into_frame(payload).map(Some)
    }

    /// Decodes exactly one complete frame.
    ///
    /// Unlike [`Frame::decode`], missing bytes are an error (`Truncated`), and
    /// so are bytes beyond the declared payload length (`LengthMismatch`).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: FRAME_HEADER_SIZE - bytes.len(),
            });
        }

        let header = Header::parse(&bytes[..FRAME_HEADER_SIZE])?;
        let available = bytes.len() - FRAME_HEADER_SIZE;
        if available < header.payload_len {
            return Err(ProtocolError::Truncated {
                needed: header.payload_len - available,
            });
        }
        if available > header.payload_len {
            return Err(ProtocolError::LengthMismatch {
                declared: header.payload_len,
                available,
            });
        }

        let payload = Bytes::copy_from_slice(&bytes[FRAME_HEADER_SIZE..]);
        header.into_frame(payload)
    }
}

/// Validated fixed header.
struct Header {
    version: u16,
    flags: FrameFlags,
    msg_type: MessageType,
    correlation_id: u32,
    payload_len: usize,
    crc_expected: u32,
}

impl Header {
    fn parse(mut raw: &[u8]) -> Result<Self, ProtocolError> {
        let magic = [raw[0], raw[1], raw[2], raw[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        raw.advance(4);

        let version = raw.get_u16();
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(raw.get_u16())?;
        let msg_type = MessageType::from_code(raw.get_u16())?;
        let correlation_id = raw.get_u32();

        let payload_len = raw.get_u32();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let crc_expected = raw.get_u32();

        Ok(Self {
            version,
            flags,
            msg_type,
            correlation_id,
            payload_len: payload_len as usize,
            crc_expected,
        })
    }

    fn into_frame(self, payload: Bytes) -> Result<Frame, ProtocolError> {
        if self.flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != self.crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: self.crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Frame {
            version: self.version,
            flags: self.flags,
            msg_type: self.msg_type,
            correlation_id: self.correlation_id,
            payload,
        })
    }
}
