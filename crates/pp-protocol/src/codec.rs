//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::encoding::PayloadEncoding;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::message::Frame;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Header decoded while waiting for its payload
    pending_header: Option<FrameHeader>,
    /// How variable-length payloads are represented on the wire
    encoding: PayloadEncoding,
    /// Ceiling on a single frame's on-wire payload
    max_payload_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new codec with raw payloads and the default ceiling
    pub fn new() -> Self {
        Self {
            pending_header: None,
            encoding: PayloadEncoding::Raw,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Set the payload encoding
    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the payload ceiling (clamped to what the length field can express)
    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max.min(u32::MAX as usize);
        self
    }

    /// Payload encoding in use
    pub fn encoding(&self) -> PayloadEncoding {
        self.encoding
    }

    /// Payload ceiling in use
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Largest raw `Data` chunk that still fits under the ceiling once encoded
    pub fn max_data_chunk(&self) -> usize {
        match self.encoding {
            PayloadEncoding::Raw => self.max_payload_size,
            PayloadEncoding::Base64 => self.max_payload_size / 4 * 3,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        // Check payload length before buffering any of it
        let payload_len = header.payload_length as usize;
        if payload_len > self.max_payload_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }

        // Check if we have enough data for the payload
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let frame = Frame::decode_payload(header.kind, payload, self.encoding)?;

        tracing::trace!(kind = ?header.kind, len = payload_len, "decoded frame");
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.pending_header.take() {
            Some(header) => Err(ProtocolError::Truncated {
                expected: HEADER_SIZE + header.payload_length as usize,
                actual: HEADER_SIZE + src.len(),
            }),
            None if !src.is_empty() => Err(ProtocolError::Truncated {
                expected: HEADER_SIZE,
                actual: src.len(),
            }),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = frame.encode_payload(self.encoding);
        let payload_len = payload.len();

        // Check payload size
        if payload_len > self.max_payload_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }

        let header = FrameHeader::new(frame.kind(), payload_len as u32);
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
