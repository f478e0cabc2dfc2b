//! Protocol error types

use thiserror::Error;

use crate::frame::FrameKind;

/// Errors produced when decoding a codec-encoded payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A byte outside the alphabet, or misplaced padding
    #[error("Malformed payload: invalid byte 0x{byte:02x} at offset {position}")]
    MalformedPayload { position: usize, byte: u8 },

    /// Input length is not a whole number of 4-character groups
    #[error("Incomplete payload: {len} characters is not a multiple of 4")]
    IncompleteInput { len: usize },
}

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The transport closed in the middle of a frame
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Header names a frame kind this side does not know
    #[error("Unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// Payload does not match the layout of its frame kind
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Declared payload length exceeds the configured ceiling
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer speaks a different protocol version
    #[error("Incompatible peer: local protocol version {local}, remote {remote}")]
    IncompatiblePeer { local: u8, remote: u8 },

    /// A frame arrived that is not valid in the current session state
    #[error("Unexpected frame: {0:?}")]
    UnexpectedFrame(FrameKind),

    /// Peer did not complete the handshake in time
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// No frame arrived within the heartbeat timeout
    #[error("Peer idle for {0:?}")]
    Idle(std::time::Duration),

    /// Payload codec failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error came from the byte stream itself rather than
    /// from the frames travelling on it.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}
