//! Slave side: owns the PTY and the child running on it

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use pp_core::{CommandSpec, ProxyConfig, SessionConfig};
use pp_protocol::{Frame, FrameReader, FrameWriter, ProtocolError};

use super::state::{SessionControl, SessionOutcome};
use super::{
    close_writer, finish, handshake, next_frame, reply_pong, write_or_cancel, CLOSE_GRACE,
    CONTROL_CHANNEL_CAPACITY,
};
use crate::error::SessionError;
use crate::pty::io::{spawn_reader, spawn_writer, PTY_CHANNEL_CAPACITY};
use crate::pty::{Pty, PtyManager};

/// Capacity of the local signal channel
const SIGNAL_CHANNEL_CAPACITY: usize = 8;

/// The slave end of a session
///
/// [`SlaveSession::establish`] allocates the PTY, spawns the child and
/// completes the handshake; [`SlaveSession::run`] relays I/O until the
/// child exits or the transport goes away, then releases the PTY.
pub struct SlaveSession<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    pty: Arc<Pty>,
    pty_reader: Box<dyn Read + Send>,
    pty_writer: Box<dyn Write + Send>,
    control: Arc<SessionControl>,
    settings: SessionConfig,
    chunk_size: usize,
    signal_tx: mpsc::Sender<i32>,
    signal_rx: mpsc::Receiver<i32>,
}

impl<R, W> SlaveSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Start `command` on a fresh PTY and handshake with the master
    ///
    /// Any failure releases the PTY before returning.
    pub async fn establish(
        reader: R,
        mut writer: W,
        config: &ProxyConfig,
        command: &CommandSpec,
    ) -> Result<Self, SessionError> {
        let settings = config.session.clone();
        let codec = config.protocol.codec();

        let pty = PtyManager::new().allocate(config.slave.initial_size)?;
        if config.slave.raw_mode {
            pty.set_raw_mode(true)?;
        }
        let pty_reader = pty.take_reader()?;
        let pty_writer = pty.take_writer()?;
        pty.attach_child(command)?;

        if config.slave.greeting {
            pp_protocol::send_greeting(&mut writer)
                .await
                .map_err(ProtocolError::from)?;
        }

        let mut reader = FrameReader::new(reader, codec.clone());
        let mut writer = FrameWriter::new(writer, codec);
        handshake(&mut reader, &mut writer, settings.handshake_timeout).await?;

        let control = Arc::new(SessionControl::new());
        control.activate();
        tracing::info!("Session established for '{}' (PID {:?})", command, pty.pid());

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

        Ok(Self {
            reader,
            writer,
            pty: Arc::new(pty),
            pty_reader,
            pty_writer,
            control,
            settings,
            chunk_size: config.protocol.chunk_size(),
            signal_tx,
            signal_rx,
        })
    }

    /// The PTY this session drives
    pub fn pty(&self) -> Arc<Pty> {
        self.pty.clone()
    }

    /// Shared state, for observing or terminating the session from outside
    pub fn control(&self) -> Arc<SessionControl> {
        self.control.clone()
    }

    /// Channel for delivering signals to the child from this side
    pub fn signal_sender(&self) -> mpsc::Sender<i32> {
        self.signal_tx.clone()
    }

    /// Relay I/O until the session ends, then release the PTY
    pub async fn run(self) -> SessionOutcome {
        let Self {
            mut reader,
            mut writer,
            pty,
            pty_reader,
            pty_writer,
            control,
            settings,
            chunk_size,
            signal_tx,
            signal_rx,
        } = self;
        drop(signal_tx);

        let (output_tx, output_rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        spawn_reader(pty_reader, chunk_size, output_tx, control.token());
        spawn_writer(pty_writer, input_rx);

        tokio::join!(
            pump_pty(&pty, output_rx, &mut writer, control_rx, &control, &settings),
            pump_transport(
                &pty,
                &mut reader,
                input_tx,
                control_tx,
                signal_rx,
                &control,
                settings.heartbeat_timeout,
            ),
        );

        let released = {
            let pty = pty.clone();
            tokio::task::spawn_blocking(move || pty.release()).await
        };
        if let Err(e) = released {
            tracing::warn!("PTY release task failed: {}", e);
        }

        close_writer(&mut writer).await;
        finish(&control)
    }
}

/// PTY output and child exit to the transport
async fn pump_pty<W>(
    pty: &Pty,
    mut output: mpsc::Receiver<Bytes>,
    writer: &mut FrameWriter<W>,
    mut control_rx: mpsc::Receiver<Frame>,
    control: &SessionControl,
    settings: &SessionConfig,
) where
    W: AsyncWrite + Unpin,
{
    let mut poll = tokio::time::interval(settings.child_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut output_open = true;

    let status = loop {
        let frame = tokio::select! {
            biased;
            _ = control.cancelled() => return,
            Some(frame) = control_rx.recv() => frame,
            chunk = output.recv(), if output_open => match chunk {
                Some(bytes) => Frame::Data(bytes),
                None => {
                    tracing::debug!("PTY output closed");
                    output_open = false;
                    poll.reset_immediately();
                    continue;
                }
            },
            _ = poll.tick() => match pty.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Child status check failed: {}", e);
                    continue;
                }
            },
        };

        match write_or_cancel(writer, frame, control).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                control.terminate(SessionOutcome::from_error(&e));
                return;
            }
        }
    };

    if let Err(e) = drain_output(&mut output, writer, control, settings.exit_drain_timeout).await {
        control.terminate(SessionOutcome::from_error(&e));
        return;
    }

    if control.terminate(SessionOutcome::Exited(status)) {
        match tokio::time::timeout(CLOSE_GRACE, writer.write_frame(Frame::Exit(status))).await {
            Ok(Ok(())) => tracing::debug!("Sent exit status {}", status),
            Ok(Err(e)) => tracing::warn!("Failed to send exit status: {}", e),
            Err(_) => tracing::warn!("Timed out sending exit status"),
        }
    }
}

/// Forward whatever the child wrote before exiting
async fn drain_output<W>(
    output: &mut mpsc::Receiver<Bytes>,
    writer: &mut FrameWriter<W>,
    control: &SessionControl,
    limit: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let deadline = Instant::now() + limit;

    loop {
        let chunk = match tokio::time::timeout_at(deadline, output.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(()),
            Err(_) => {
                tracing::debug!("Stopped draining PTY output after {:?}", limit);
                return Ok(());
            }
        };
        if !write_or_cancel(writer, Frame::Data(chunk), control).await? {
            return Ok(());
        }
    }
}

/// Transport and local signals to the PTY
async fn pump_transport<R>(
    pty: &Pty,
    reader: &mut FrameReader<R>,
    input: mpsc::Sender<Bytes>,
    control_tx: mpsc::Sender<Frame>,
    mut signals: mpsc::Receiver<i32>,
    control: &SessionControl,
    heartbeat_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let mut last_seen = Instant::now();

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = control.cancelled() => break None,
            Some(signal) = signals.recv() => {
                deliver_signal(pty, signal);
                continue;
            }
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
                let len = bytes.len();
                tokio::select! {
                    biased;
                    _ = control.cancelled() => break None,
                    sent = input.send(bytes) => if sent.is_err() {
                        tracing::debug!("PTY input closed, dropped {} bytes", len);
                    },
                }
            }
            Frame::Resize(size) => {
                if let Err(e) = pty.resize(size) {
                    tracing::warn!("Resize to {}x{} failed: {}", size.cols, size.rows, e);
                }
            }
            Frame::Signal(signal) => deliver_signal(pty, i32::from(signal)),
            Frame::Ping(payload) => reply_pong(&control_tx, payload),
            Frame::Pong(_) => tracing::trace!("Pong received"),
            other => {
                let error = ProtocolError::UnexpectedFrame(other.kind());
                break Some(SessionOutcome::from_error(&error));
            }
        }
    };

    if let Some(outcome) = outcome {
        control.terminate(outcome);
    }
}

fn deliver_signal(pty: &Pty, signal: i32) {
    if let Err(e) = pty.signal(signal) {
        tracing::warn!("Signal {} not delivered: {}", signal, e);
    }
}
