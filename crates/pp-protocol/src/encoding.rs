//! Transport-safe payload encoding
//!
//! `Data`, `Ping` and `Pong` payloads may have to cross a byte stream that is
//! not 8-bit clean. In that mode they are carried as standard base64 text
//! (`A-Z a-z 0-9 + /`, `=` padding). Control payloads are never encoded.

use base64::engine::general_purpose::STANDARD;
use base64::{DecodeError, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

const PAD: u8 = b'=';

/// How variable-length payloads are represented on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Payload bytes are written as-is
    #[default]
    Raw,
    /// Payload bytes are written as base64 text
    Base64,
}

impl PayloadEncoding {
    /// Encode a payload for the wire
    pub fn encode_payload(&self, payload: &[u8]) -> Bytes {
        match self {
            PayloadEncoding::Raw => Bytes::copy_from_slice(payload),
            PayloadEncoding::Base64 => Bytes::from(encode(payload).into_bytes()),
        }
    }

    /// Decode a payload read from the wire
    pub fn decode_payload(&self, wire: Bytes) -> Result<Bytes, CodecError> {
        match self {
            PayloadEncoding::Raw => Ok(wire),
            PayloadEncoding::Base64 => decode(&wire).map(Bytes::from),
        }
    }

    /// Size on the wire of a payload of `len` bytes
    pub fn wire_len(&self, len: usize) -> usize {
        match self {
            PayloadEncoding::Raw => len,
            PayloadEncoding::Base64 => encoded_len(len),
        }
    }
}

/// Number of characters `encode` produces for `len` input bytes
pub fn encoded_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

/// Encode bytes as padded base64 text
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode padded base64 text
///
/// Any byte outside the alphabet (whitespace included) or a misplaced `=`
/// yields `MalformedPayload`. Input that is well-formed so far but not a
/// whole number of 4-character groups yields `IncompleteInput`.
pub fn decode(text: impl AsRef<[u8]>) -> Result<Vec<u8>, CodecError> {
    let text = text.as_ref();
    validate(text)?;

    STANDARD.decode(text).map_err(|e| match e {
        DecodeError::InvalidByte(position, byte) | DecodeError::InvalidLastSymbol(position, byte) => {
            CodecError::MalformedPayload { position, byte }
        }
        DecodeError::InvalidLength(len) => CodecError::IncompleteInput { len },
        DecodeError::InvalidPadding => CodecError::MalformedPayload {
            position: text.len().saturating_sub(1),
            byte: PAD,
        },
    })
}

fn is_alphabet(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'/'
}

/// Check alphabet and padding placement before handing off to the engine,
/// so that every failure is reported with the offending position.
fn validate(text: &[u8]) -> Result<(), CodecError> {
    let mut first_pad = None;

    for (position, &byte) in text.iter().enumerate() {
        if byte == PAD {
            first_pad.get_or_insert(position);
            continue;
        }
        if !is_alphabet(byte) || first_pad.is_some() {
            return Err(CodecError::MalformedPayload { position, byte });
        }
    }

    if text.len() % 4 != 0 {
        return Err(CodecError::IncompleteInput { len: text.len() });
    }

    if let Some(position) = first_pad {
        // At most two pad characters, and never the first two of a group.
        if text.len() - position > 2 || position % 4 < 2 {
            return Err(CodecError::MalformedPayload {
                position,
                byte: PAD,
            });
        }
    }

    Ok(())
}
