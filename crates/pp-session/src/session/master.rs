//! Master side: the user's terminal

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use pp_core::{ProxyConfig, SessionConfig};
use pp_protocol::{Frame, FrameReader, FrameWriter, ProtocolError, TerminalSize};

use super::state::{SessionControl, SessionOutcome};
use super::{
    close_writer, finish, handshake, next_frame, reply_pong, write_or_cancel, CLOSE_GRACE,
    CONTROL_CHANNEL_CAPACITY,
};
use crate::error::SessionError;

/// Something the local terminal wants the slave to know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    /// The local window changed size
    Resize(TerminalSize),
    /// Deliver this signal to the remote child
    Signal(u8),
}

/// The master end of a session
///
/// Created by [`MasterSession::establish`], which completes the handshake,
/// then driven to completion by [`MasterSession::run`].
pub struct MasterSession<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    control: Arc<SessionControl>,
    settings: SessionConfig,
    chunk_size: usize,
}

impl<R, W> MasterSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Perform the handshake over `reader`/`writer`
    ///
    /// With `await_greeting`, bytes are discarded until the slave's greeting
    /// marker has been seen.
    pub async fn establish(
        mut reader: R,
        writer: W,
        config: &ProxyConfig,
        await_greeting: bool,
    ) -> Result<Self, SessionError> {
        let settings = config.session.clone();
        let codec = config.protocol.codec();

        if await_greeting {
            let greeting = pp_protocol::expect_greeting(&mut reader);
            match tokio::time::timeout(settings.handshake_timeout, greeting).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => return Err(ProtocolError::HandshakeTimeout.into()),
            }
            tracing::debug!("Slave greeting received");
        }

        let mut reader = FrameReader::new(reader, codec.clone());
        let mut writer = FrameWriter::new(writer, codec);
        handshake(&mut reader, &mut writer, settings.handshake_timeout).await?;

        let control = Arc::new(SessionControl::new());
        control.activate();
        tracing::info!(
            "Session established ({:?} payloads)",
            config.protocol.payload_encoding
        );

        Ok(Self {
            reader,
            writer,
            control,
            settings,
            chunk_size: config.protocol.chunk_size(),
        })
    }

    /// Shared state, for observing or terminating the session from outside
    pub fn control(&self) -> Arc<SessionControl> {
        self.control.clone()
    }

    /// Relay `input` to the slave and slave output to `output` until the
    /// session ends
    ///
    /// `events` carries window size changes and signals; closing it does not
    /// end the session.
    pub async fn run<I, O>(
        mut self,
        input: I,
        output: O,
        events: mpsc::Receiver<LocalEvent>,
    ) -> SessionOutcome
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let started = Instant::now();
        let control = &*self.control;

        tokio::join!(
            pump_local(
                input,
                events,
                &mut self.writer,
                control_rx,
                control,
                self.settings.heartbeat_interval,
                self.chunk_size,
                started,
            ),
            pump_remote(
                &mut self.reader,
                output,
                control_tx,
                control,
                self.settings.heartbeat_timeout,
                started,
            ),
        );

        close_writer(&mut self.writer).await;
        finish(control)
    }
}

/// Local input and events to the transport
#[allow(clippy::too_many_arguments)]
async fn pump_local<I, W>(
    mut input: I,
    mut events: mpsc::Receiver<LocalEvent>,
    writer: &mut FrameWriter<W>,
    mut control_rx: mpsc::Receiver<Frame>,
    control: &SessionControl,
    heartbeat_interval: Option<Duration>,
    chunk_size: usize,
    started: Instant,
) where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut events_open = true;
    let mut heartbeat = heartbeat_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    let outcome = loop {
        let frame = tokio::select! {
            biased;
            _ = control.cancelled() => break None,
            Some(frame) = control_rx.recv() => frame,
            event = events.recv(), if events_open => match event {
                Some(LocalEvent::Resize(size)) => Frame::Resize(size),
                Some(LocalEvent::Signal(signal)) => Frame::Signal(signal),
                None => {
                    events_open = false;
                    continue;
                }
            },
            _ = tick(&mut heartbeat) => Frame::Ping(ping_payload(started)),
            read = input.read(&mut buf) => match read {
                Ok(0) => break Some(SessionOutcome::LocalClosed),
                Ok(n) => Frame::data(&buf[..n]),
                Err(e) => {
                    tracing::warn!("Local input failed: {}", e);
                    break Some(SessionOutcome::LocalClosed);
                }
            },
        };

        match write_or_cancel(writer, frame, control).await {
            Ok(true) => {}
            Ok(false) => break None,
            Err(e) => break Some(SessionOutcome::from_error(&e)),
        }
    };

    if let Some(outcome) = outcome {
        control.terminate(outcome);
    }
}

/// Transport to local output
async fn pump_remote<R, O>(
    reader: &mut FrameReader<R>,
    mut output: O,
    control_tx: mpsc::Sender<Frame>,
    control: &SessionControl,
    heartbeat_timeout: Option<Duration>,
    started: Instant,
) where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut last_seen = Instant::now();

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = control.cancelled() => break None,
            next = next_frame(reader, heartbeat_timeout, last_seen) => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                break Some(SessionOutcome::TransportError(
                    "peer closed the transport".to_string(),
                ))
            }
            Err(e) => break Some(SessionOutcome::from_error(&e)),
        };
        last_seen = Instant::now();

        match frame {
            Frame::Data(bytes) => {
                let written = tokio::select! {
                    biased;
                    _ = control.cancelled() => break None,
                    written = write_local(&mut output, &bytes) => written,
                };
                if let Err(e) = written {
                    tracing::warn!("Local output failed: {}", e);
                    break Some(SessionOutcome::LocalClosed);
                }
            }
            Frame::Exit(status) => break Some(SessionOutcome::Exited(status)),
            Frame::Ping(payload) => reply_pong(&control_tx, payload),
            Frame::Pong(payload) => log_round_trip(&payload, started),
            Frame::Resize(size) => {
                tracing::debug!("Peer reported size {}x{}", size.cols, size.rows)
            }
            Frame::Signal(signal) => tracing::debug!("Peer reported signal {}", signal),
            other => {
                let error = ProtocolError::UnexpectedFrame(other.kind());
                break Some(SessionOutcome::from_error(&error));
            }
        }
    };

    if let Some(outcome) = outcome {
        control.terminate(outcome);
    }
    match tokio::time::timeout(CLOSE_GRACE, output.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Local output flush failed: {}", e),
        Err(_) => tracing::debug!("Local output still blocked after {:?}", CLOSE_GRACE),
    }
}

async fn write_local<O: AsyncWrite + Unpin>(output: &mut O, bytes: &[u8]) -> std::io::Result<()> {
    output.write_all(bytes).await?;
    output.flush().await
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Milliseconds since the session started, big-endian
fn ping_payload(started: Instant) -> Bytes {
    let millis = started.elapsed().as_millis() as u64;
    Bytes::copy_from_slice(&millis.to_be_bytes())
}

fn log_round_trip(payload: &[u8], started: Instant) {
    match <[u8; 8]>::try_from(payload) {
        Ok(sent) => {
            let sent = Duration::from_millis(u64::from_be_bytes(sent));
            let rtt = started.elapsed().saturating_sub(sent);
            tracing::debug!("Heartbeat round trip {:?}", rtt);
        }
        Err(_) => tracing::debug!("Pong with {} byte payload", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pp_protocol::{FrameCodec, PROTOCOL_VERSION};
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type Peer = (FrameReader<ReadHalf<DuplexStream>>, FrameWriter<WriteHalf<DuplexStream>>);

    /// Establish a master against a scripted peer that has already answered
    /// the handshake
    async fn connect(
        config: &ProxyConfig,
    ) -> (MasterSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>, Peer) {
        let (local, remote) = duplex(64 * 1024);
        let (local_read, local_write) = split(local);
        let (remote_read, remote_write) = split(remote);

        let mut peer_reader = FrameReader::new(remote_read, FrameCodec::new());
        let mut peer_writer = FrameWriter::new(remote_write, FrameCodec::new());
        peer_writer
            .write_frame(Frame::Handshake(PROTOCOL_VERSION))
            .await
            .unwrap();

        let master = MasterSession::establish(local_read, local_write, config, false)
            .await
            .unwrap();
        assert_eq!(
            peer_reader.read_frame().await.unwrap(),
            Some(Frame::Handshake(PROTOCOL_VERSION))
        );

        (master, (peer_reader, peer_writer))
    }

    #[tokio::test]
    async fn test_input_becomes_data_and_exit_ends_session() {
        let config = ProxyConfig::default();
        let (master, (mut peer_reader, mut peer_writer)) = connect(&config).await;

        let (mut user, input) = duplex(1024);
        let (output, mut screen) = duplex(1024);
        let (_events_tx, events_rx) = mpsc::channel(4);

        let session = tokio::spawn(master.run(input, output, events_rx));

        user.write_all(b"ls\n").await.unwrap();
        assert_eq!(
            peer_reader.read_frame().await.unwrap(),
            Some(Frame::data(b"ls\n"))
        );

        peer_writer.write_frame(Frame::data(b"file\n")).await.unwrap();
        peer_writer.write_frame(Frame::Exit(3)).await.unwrap();

        assert_eq!(session.await.unwrap(), SessionOutcome::Exited(3));

        let mut shown = Vec::new();
        screen.read_to_end(&mut shown).await.unwrap();
        assert_eq!(shown, b"file\n");
    }

    #[tokio::test]
    async fn test_local_eof_closes_session() {
        let config = ProxyConfig::default();
        let (master, (mut peer_reader, _peer_writer)) = connect(&config).await;

        let (user, input) = duplex(1024);
        let (output, _screen) = duplex(1024);
        let (_events_tx, events_rx) = mpsc::channel(4);
        drop(user);

        let outcome = master.run(input, output, events_rx).await;
        assert_eq!(outcome, SessionOutcome::LocalClosed);
        // write half was shut down
        assert_eq!(peer_reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_events_become_control_frames() {
        let config = ProxyConfig::default();
        let (master, (mut peer_reader, mut peer_writer)) = connect(&config).await;

        let (_user, input) = duplex(1024);
        let (output, _screen) = duplex(1024);
        let (events_tx, events_rx) = mpsc::channel(4);

        let control = master.control();
        let session = tokio::spawn(master.run(input, output, events_rx));

        events_tx
            .send(LocalEvent::Resize(TerminalSize::new(50, 132)))
            .await
            .unwrap();
        events_tx.send(LocalEvent::Signal(2)).await.unwrap();

        assert_eq!(
            peer_reader.read_frame().await.unwrap(),
            Some(Frame::Resize(TerminalSize::new(50, 132)))
        );
        assert_eq!(peer_reader.read_frame().await.unwrap(), Some(Frame::Signal(2)));

        // closing the event channel does not end the session
        drop(events_tx);
        tokio::task::yield_now().await;
        assert!(!control.is_terminating());

        peer_writer.write_frame(Frame::Exit(0)).await.unwrap();
        assert_eq!(session.await.unwrap(), SessionOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let config = ProxyConfig::default();
        let (master, (mut peer_reader, mut peer_writer)) = connect(&config).await;

        let (_user, input) = duplex(1024);
        let (output, _screen) = duplex(1024);
        let (_events_tx, events_rx) = mpsc::channel(4);
        let session = tokio::spawn(master.run(input, output, events_rx));

        peer_writer
            .write_frame(Frame::Ping(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        assert_eq!(
            peer_reader.read_frame().await.unwrap(),
            Some(Frame::Pong(Bytes::from_static(b"abc")))
        );

        peer_writer.write_frame(Frame::Exit(1)).await.unwrap();
        assert_eq!(session.await.unwrap(), SessionOutcome::Exited(1));
    }

    #[tokio::test]
    async fn test_peer_close_is_transport_error() {
        let config = ProxyConfig::default();
        let (master, peer) = connect(&config).await;

        let (_user, input) = duplex(1024);
        let (output, _screen) = duplex(1024);
        let (_events_tx, events_rx) = mpsc::channel(4);
        let control = master.control();
        drop(peer);

        let outcome = master.run(input, output, events_rx).await;
        assert!(matches!(outcome, SessionOutcome::TransportError(_)));
        assert_eq!(outcome.exit_code(), 255);
        assert_eq!(control.state(), crate::SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_protocol_error() {
        let config = ProxyConfig::default();
        let (master, (_peer_reader, peer_writer)) = connect(&config).await;
        let mut raw = peer_writer.into_inner();
        raw.write_all(&[0x7f, 0, 0, 0, 0]).await.unwrap();

        let (_user, input) = duplex(1024);
        let (output, _screen) = duplex(1024);
        let (_events_tx, events_rx) = mpsc::channel(4);

        let outcome = master.run(input, output, events_rx).await;
        assert!(matches!(outcome, SessionOutcome::ProtocolError(_)));
        assert_eq!(outcome.exit_code(), 254);
    }

    #[tokio::test]
    async fn test_blocked_output_does_not_stall_teardown() {
        let config = ProxyConfig::default();
        let (master, (_peer_reader, mut peer_writer)) = connect(&config).await;

        let (user, input) = duplex(1024);
        // nobody drains the screen, so writes block once 16 bytes are buffered
        let (output, _screen) = duplex(16);
        let (_events_tx, events_rx) = mpsc::channel(4);
        let control = master.control();
        let session = tokio::spawn(master.run(input, output, events_rx));

        peer_writer
            .write_frame(Frame::Data(Bytes::from(vec![b'x'; 1024])))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(user);

        let outcome = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session stalled behind blocked output")
            .unwrap();
        assert_eq!(outcome, SessionOutcome::LocalClosed);
        assert_eq!(control.state(), crate::SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout() {
        let mut config = ProxyConfig::default();
        config.session.heartbeat_interval = Some(Duration::from_secs(1));
        config.session.heartbeat_timeout = Some(Duration::from_secs(3));
        let (master, (mut peer_reader, _peer_writer)) = connect(&config).await;

        let (_user, input) = duplex(1024);
        let (output, _screen) = duplex(1024);
        let (_events_tx, events_rx) = mpsc::channel(4);
        let session = tokio::spawn(master.run(input, output, events_rx));

        // peer never answers
        assert!(matches!(
            peer_reader.read_frame().await.unwrap(),
            Some(Frame::Ping(_))
        ));

        let outcome = session.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_greeting_precedes_handshake() {
        let (local, remote) = duplex(1024);
        let (local_read, local_write) = split(local);
        let (_remote_read, mut remote_write) = split(remote);

        remote_write.write_all(b"motd\r\n").await.unwrap();
        pp_protocol::send_greeting(&mut remote_write).await.unwrap();
        let mut peer = FrameWriter::new(remote_write, FrameCodec::new());
        peer.write_frame(Frame::Handshake(PROTOCOL_VERSION))
            .await
            .unwrap();

        let config = ProxyConfig::default();
        let master = MasterSession::establish(local_read, local_write, &config, true).await;
        assert!(master.is_ok());
    }
}
