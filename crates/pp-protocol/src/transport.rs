//! Frame I/O over any byte stream
//!
//! The session layer only needs an `AsyncRead` half and an `AsyncWrite` half;
//! pipes, sockets and inherited descriptors all qualify.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::FrameCodec;
use crate::error::ProtocolError;
use crate::message::Frame;

/// Readiness marker a slave may print before the handshake
pub const GREETING: &[u8] = b"PTY_SLAVE_GREETING";

/// Upper bound on bytes skipped while looking for the greeting
const GREETING_SCAN_LIMIT: usize = 64 * 1024;

/// Reads whole frames from a byte stream
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame
    /// boundary, `Truncated` when it closed inside a frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.inner.next().await.transpose()
    }
}

/// Writes whole frames to a byte stream
pub struct FrameWriter<W> {
    inner: FramedWrite<W, FrameCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec),
        }
    }

    /// Write one frame and flush it
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.inner.send(frame).await
    }

    /// Flush anything pending and shut the stream down
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.close().await
    }

    /// Get the underlying writer back
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

/// Write the greeting marker
pub async fn send_greeting<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(GREETING).await?;
    writer.flush().await
}

/// Consume bytes until the greeting marker has been seen
///
/// Reads one byte at a time so that nothing past the marker is taken from
/// the stream. Returns the number of bytes that preceded the marker.
pub async fn expect_greeting<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, ProtocolError> {
    let mut window: Vec<u8> = Vec::with_capacity(GREETING.len());
    let mut consumed = 0usize;

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::Truncated {
                    expected: GREETING.len(),
                    actual: window.len(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        consumed += 1;

        if window.len() == GREETING.len() {
            window.remove(0);
        }
        window.push(byte);

        if window == GREETING {
            let skipped = consumed - GREETING.len();
            if skipped > 0 {
                tracing::debug!(skipped, "skipped bytes before greeting");
            }
            return Ok(skipped);
        }

        if consumed >= GREETING_SCAN_LIMIT {
            return Err(ProtocolError::Malformed(format!(
                "no greeting within {} bytes",
                GREETING_SCAN_LIMIT
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::PayloadEncoding;
    use crate::message::TerminalSize;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_write_then_read() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(a, FrameCodec::new());
        let mut reader = FrameReader::new(b, FrameCodec::new());

        let frames = vec![
            Frame::Handshake(1),
            Frame::data(&[0u8; 300]),
            Frame::Resize(TerminalSize::new(50, 132)),
        ];

        let expected = frames.clone();
        let write = tokio::spawn(async move {
            for frame in frames {
                writer.write_frame(frame).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        for frame in expected {
            assert_eq!(reader.read_frame().await.unwrap(), Some(frame));
        }
        assert_eq!(reader.read_frame().await.unwrap(), None);
        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_truncated() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b, FrameCodec::new());

        a.write_all(&[0x00, 0x00, 0x00, 0x00, 0x09, b'a']).await.unwrap();
        drop(a);

        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn test_base64_transport() {
        let (a, b) = tokio::io::duplex(1024);
        let codec = FrameCodec::new().with_encoding(PayloadEncoding::Base64);
        let mut writer = FrameWriter::new(a, codec.clone());
        let mut reader = FrameReader::new(b, codec);

        writer
            .write_frame(Frame::Data(Bytes::from_static(b"\x00\x1b[0m")))
            .await
            .unwrap();
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Data(Bytes::from_static(b"\x00\x1b[0m")))
        );
    }

    #[tokio::test]
    async fn test_expect_greeting_leaves_following_bytes() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(b"motd line\r\nPTY_PTY_SLAVE_GREETING").await.unwrap();
        a.write_all(&[0x04, 0, 0, 0, 1, 1]).await.unwrap();
        drop(a);

        let skipped = expect_greeting(&mut b).await.unwrap();
        assert_eq!(skipped, b"motd line\r\nPTY_".len());

        let mut reader = FrameReader::new(b, FrameCodec::new());
        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::Handshake(1)));
    }

    #[tokio::test]
    async fn test_expect_greeting_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"PTY_SLAVE").await.unwrap();
        drop(a);

        assert!(matches!(
            expect_greeting(&mut b).await,
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
