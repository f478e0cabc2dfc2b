//! Frames exchanged between master and slave
//!
//! # Protocol Version
//!
//! Each side opens with `Handshake(PROTOCOL_VERSION)` and requires the
//! peer's first frame to be a `Handshake` carrying the same version.
//!
//! # Payload layouts (all integers big-endian)
//!
//! | kind      | payload                          |
//! |-----------|----------------------------------|
//! | Data      | terminal bytes (maybe base64)    |
//! | Resize    | `[u16 rows][u16 cols]`           |
//! | Signal    | `[u8 signal]`                    |
//! | Exit      | `[i32 status]`                   |
//! | Handshake | `[u8 version]`                   |
//! | Ping/Pong | opaque bytes (maybe base64)      |
//!
//! # Frame Flow
//!
//! 1. Both sides send `Handshake`
//! 2. Terminal I/O: `Data` frames flow in both directions
//! 3. Window resize and signals: `Resize`/`Signal` from master
//! 4. Keepalive: `Ping` from either side, answered with `Pong`
//! 5. Session end: `Exit` from slave once the child has exited

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::encoding::PayloadEncoding;
use crate::error::ProtocolError;
use crate::frame::FrameKind;

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal bytes
    Data(Bytes),
    /// Terminal size change
    Resize(TerminalSize),
    /// Signal number to deliver to the child
    Signal(u8),
    /// Child exit status
    Exit(i32),
    /// Protocol version
    Handshake(u8),
    /// Keepalive request
    Ping(Bytes),
    /// Keepalive reply, echoing the request payload
    Pong(Bytes),
}

impl Frame {
    /// Get the kind of this frame
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data(_) => FrameKind::Data,
            Frame::Resize(_) => FrameKind::Resize,
            Frame::Signal(_) => FrameKind::Signal,
            Frame::Exit(_) => FrameKind::Exit,
            Frame::Handshake(_) => FrameKind::Handshake,
            Frame::Ping(_) => FrameKind::Ping,
            Frame::Pong(_) => FrameKind::Pong,
        }
    }

    /// Data frame from a byte slice
    pub fn data(bytes: &[u8]) -> Self {
        Frame::Data(Bytes::copy_from_slice(bytes))
    }

    /// Serialize the payload as it appears on the wire
    pub fn encode_payload(&self, encoding: PayloadEncoding) -> Bytes {
        match self {
            Frame::Data(bytes) | Frame::Ping(bytes) | Frame::Pong(bytes) => {
                encoding.encode_payload(bytes)
            }
            Frame::Resize(size) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u16(size.rows);
                buf.put_u16(size.cols);
                buf.freeze()
            }
            Frame::Signal(signal) => Bytes::copy_from_slice(&[*signal]),
            Frame::Exit(status) => Bytes::copy_from_slice(&status.to_be_bytes()),
            Frame::Handshake(version) => Bytes::copy_from_slice(&[*version]),
        }
    }

    /// Rebuild a frame from its kind and on-wire payload
    pub fn decode_payload(
        kind: FrameKind,
        mut payload: Bytes,
        encoding: PayloadEncoding,
    ) -> Result<Self, ProtocolError> {
        if let Some(expected) = kind.fixed_payload_len() {
            if payload.len() != expected {
                return Err(ProtocolError::Malformed(format!(
                    "{:?} payload must be {} bytes, got {}",
                    kind,
                    expected,
                    payload.len()
                )));
            }
        }

        let frame = match kind {
            FrameKind::Data => Frame::Data(encoding.decode_payload(payload)?),
            FrameKind::Ping => Frame::Ping(encoding.decode_payload(payload)?),
            FrameKind::Pong => Frame::Pong(encoding.decode_payload(payload)?),
            FrameKind::Resize => {
                let rows = payload.get_u16();
                let cols = payload.get_u16();
                Frame::Resize(TerminalSize::new(rows, cols))
            }
            FrameKind::Signal => Frame::Signal(payload.get_u8()),
            FrameKind::Exit => Frame::Exit(payload.get_i32()),
            FrameKind::Handshake => Frame::Handshake(payload.get_u8()),
        };

        Ok(frame)
    }
}
