//! Encoder and decoder for frames on a byte stream.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{ErrorBody, MessageType};
use bytes::{Bytes, BytesMut};

/// Encodes requests, replies and pushes into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a request.
    pub fn encode_request(
        msg_type: MessageType,
        correlation_id: u32,
        payload: Bytes,
    ) -> Result<BytesMut, ProtocolError> {
        Frame::new(msg_type, correlation_id, payload).encode()
    }

    /// Encodes a request the peer must not answer.
    pub fn encode_oneway(
        msg_type: MessageType,
        correlation_id: u32,
        payload: Bytes,
    ) -> Result<BytesMut, ProtocolError> {
        let mut frame = Frame::new(msg_type, correlation_id, payload);
        frame.flags = frame.flags.with_no_reply();
        frame.encode()
    }

    /// Encodes a successful reply.
    pub fn encode_reply(
        msg_type: MessageType,
        correlation_id: u32,
        payload: Bytes,
    ) -> Result<BytesMut, ProtocolError> {
        Frame::reply(msg_type, correlation_id, payload).encode()
    }

    /// Encodes an error reply.
    pub fn encode_error(
        msg_type: MessageType,
        correlation_id: u32,
        error: &ErrorBody,
    ) -> Result<BytesMut, ProtocolError> {
        Frame::error(msg_type, correlation_id, error)?.encode()
    }

    /// Encodes a server-initiated push.
    pub fn encode_push(msg_type: MessageType, payload: Bytes) -> Result<BytesMut, ProtocolError> {
        Frame::push(msg_type, payload).encode()
    }

    /// Encodes a request with a JSON body.
    pub fn encode_json<T: serde::Serialize>(
        msg_type: MessageType,
        correlation_id: u32,
        value: &T,
    ) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(msg_type, correlation_id, value)?.encode()
    }
}

/// Buffers bytes read from a connection and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
