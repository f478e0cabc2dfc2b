//! Frame header encoding/decoding
//!
//! The frame format uses a 5-byte header:
//! - kind: 1 byte (u8)
//! - payload_length: 4 bytes (u32, big-endian)
//!
//! followed by exactly `payload_length` bytes of payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Default ceiling on a single frame's on-wire payload
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Terminal bytes
    Data = 0x00,
    /// Terminal size change
    Resize = 0x01,
    /// Signal to deliver to the attached child
    Signal = 0x02,
    /// Child exit status
    Exit = 0x03,
    /// Protocol version announcement
    Handshake = 0x04,
    /// Keepalive request
    Ping = 0x05,
    /// Keepalive reply
    Pong = 0x06,
}

impl FrameKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::Resize),
            0x02 => Some(Self::Signal),
            0x03 => Some(Self::Exit),
            0x04 => Some(Self::Handshake),
            0x05 => Some(Self::Ping),
            0x06 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Exact payload size for kinds with a fixed layout
    pub fn fixed_payload_len(&self) -> Option<usize> {
        match self {
            FrameKind::Resize | FrameKind::Exit => Some(4),
            FrameKind::Signal | FrameKind::Handshake => Some(1),
            FrameKind::Data | FrameKind::Ping | FrameKind::Pong => None,
        }
    }

    /// Whether the payload goes through the payload encoding
    pub fn carries_bytes(&self) -> bool {
        self.fixed_payload_len().is_none()
    }
}

/// Frame header containing kind and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Kind of frame
    pub kind: FrameKind,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(kind: FrameKind, payload_length: u32) -> Self {
        Self {
            kind,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.kind.as_u8());
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown kind, or a fixed-size
    /// kind announcing the wrong length). Nothing is consumed on error.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the kind first to validate
        let kind_byte = src[0];
        let kind = FrameKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;
        let payload_length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);

        if let Some(expected) = kind.fixed_payload_len() {
            if payload_length as usize != expected {
                return Err(ProtocolError::Malformed(format!(
                    "{:?} payload must be {} bytes, header declares {}",
                    kind, expected, payload_length
                )));
            }
        }

        src.advance(HEADER_SIZE);

        Ok(Some(Self {
            kind,
            payload_length,
        }))
    }
}
