//! pp-protocol: Wire protocol for pty-proxy sessions
//!
//! This crate defines the framed binary protocol used between a master
//! and a slave over any bidirectional byte stream, and the base64 codec
//! used for payloads when the stream is not 8-bit clean.

pub mod codec;
pub mod encoding;
pub mod error;
pub mod frame;
pub mod message;
pub mod transport;

pub use codec::FrameCodec;
pub use encoding::PayloadEncoding;
pub use error::{CodecError, ProtocolError};
pub use frame::{FrameHeader, FrameKind, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
pub use message::{Frame, TerminalSize, PROTOCOL_VERSION};
pub use transport::{expect_greeting, send_greeting, FrameReader, FrameWriter, GREETING};
