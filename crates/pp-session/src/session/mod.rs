//! Master and slave sessions
//!
//! Each session runs two pumps, one per direction, over a shared
//! [`SessionControl`]. Only the outbound pump writes to the transport;
//! frames the inbound pump needs to send (`Pong` replies) go through a
//! small control channel to it.

mod master;
mod slave;
mod state;

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use pp_protocol::{Frame, FrameReader, FrameWriter, ProtocolError, PROTOCOL_VERSION};

pub use master::{LocalEvent, MasterSession};
pub use slave::SlaveSession;
pub use state::{
    SessionControl, SessionOutcome, SessionState, PROTOCOL_FAILURE_CODE, TRANSPORT_FAILURE_CODE,
};

/// Capacity of the inbound-to-outbound control channel
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the master's local event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Upper bound on final writes once a session is closing
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Exchange `Handshake` frames with the peer
///
/// Our frame goes out first so that two sides running this concurrently
/// cannot deadlock.
async fn handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    timeout: Duration,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        writer.write_frame(Frame::Handshake(PROTOCOL_VERSION)).await?;

        match reader.read_frame().await? {
            Some(Frame::Handshake(version)) if version == PROTOCOL_VERSION => Ok(()),
            Some(Frame::Handshake(version)) => Err(ProtocolError::IncompatiblePeer {
                local: PROTOCOL_VERSION,
                remote: version,
            }),
            Some(other) => Err(ProtocolError::UnexpectedFrame(other.kind())),
            None => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the transport during handshake",
            ))),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::HandshakeTimeout),
    }
}

/// Read the next frame, failing if nothing has arrived for `idle` since `last_seen`
async fn next_frame<R>(
    reader: &mut FrameReader<R>,
    idle: Option<Duration>,
    last_seen: Instant,
) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(limit) => match tokio::time::timeout_at(last_seen + limit, reader.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Idle(limit)),
        },
        None => reader.read_frame().await,
    }
}

/// Write a frame unless the session starts closing first
///
/// Returns `Ok(false)` if the write was abandoned.
async fn write_or_cancel<W>(
    writer: &mut FrameWriter<W>,
    frame: Frame,
    control: &SessionControl,
) -> Result<bool, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = control.cancelled() => Ok(false),
        result = writer.write_frame(frame) => result.map(|_| true),
    }
}

/// Queue a `Pong` for the outbound pump without blocking the reader
fn reply_pong(control_tx: &mpsc::Sender<Frame>, payload: Bytes) {
    if control_tx.try_send(Frame::Pong(payload)).is_err() {
        tracing::debug!("Control channel full, dropping pong");
    }
}

/// Flush and close the transport's write half
async fn close_writer<W>(writer: &mut FrameWriter<W>)
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Transport shutdown failed: {}", e),
        Err(_) => tracing::debug!("Transport shutdown timed out"),
    }
}

/// Session outcome after both pumps have stopped
fn finish(control: &SessionControl) -> SessionOutcome {
    control.close();
    control.outcome().unwrap_or_else(|| {
        SessionOutcome::TransportError("session ended without an outcome".to_string())
    })
}
