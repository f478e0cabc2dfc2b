//! Master and slave sessions wired together over an in-memory transport
//!
//! Each test runs real children on a real PTY, so these only run on unix.

#![cfg(unix)]

use std::time::Duration;

use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use pp_core::{CommandSpec, ProxyConfig};
use pp_protocol::{
    Frame, FrameCodec, FrameReader, FrameWriter, PayloadEncoding, TerminalSize, PROTOCOL_VERSION,
};
use pp_session::{
    LocalEvent, MasterSession, PtyError, SessionError, SessionOutcome, SessionState, SlaveSession,
};

type Half = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

const TIMEOUT: Duration = Duration::from_secs(20);

fn transport() -> (Half, Half) {
    let (a, b) = duplex(64 * 1024);
    (split(a), split(b))
}

async fn connect(
    config: &ProxyConfig,
    command: CommandSpec,
) -> (
    MasterSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
    SlaveSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
) {
    let ((m_read, m_write), (s_read, s_write)) = transport();
    let (master, slave) = tokio::join!(
        MasterSession::establish(m_read, m_write, config, config.slave.greeting),
        SlaveSession::establish(s_read, s_write, config, &command),
    );
    (master.unwrap(), slave.unwrap())
}

type PeerReader = FrameReader<ReadHalf<DuplexStream>>;
type PeerWriter = FrameWriter<WriteHalf<DuplexStream>>;

/// A slave facing a hand-driven peer instead of a `MasterSession`
async fn connect_slave(
    command: CommandSpec,
) -> (
    SlaveSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
    PeerReader,
    PeerWriter,
) {
    let config = ProxyConfig::default();
    let ((p_read, p_write), (s_read, s_write)) = transport();
    let mut peer_reader = FrameReader::new(p_read, FrameCodec::new());
    let mut peer_writer = FrameWriter::new(p_write, FrameCodec::new());

    let (slave, greeted) = tokio::join!(
        SlaveSession::establish(s_read, s_write, &config, &command),
        async {
            peer_writer
                .write_frame(Frame::Handshake(PROTOCOL_VERSION))
                .await
                .unwrap();
            peer_reader.read_frame().await.unwrap()
        },
    );
    assert_eq!(greeted, Some(Frame::Handshake(PROTOCOL_VERSION)));
    (slave.unwrap(), peer_reader, peer_writer)
}

/// Everything the slave sends until it closes the transport
async fn collect_frames(reader: &mut PeerReader) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = reader.read_frame().await.unwrap() {
        frames.push(frame);
    }
    frames
}

fn exit_frames(frames: &[Frame]) -> Vec<i32> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Exit(status) => Some(*status),
            _ => None,
        })
        .collect()
}

/// Read from the screen until `needle` shows up
async fn read_until(screen: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(TIMEOUT, async {
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = screen.read(&mut buf).await.unwrap();
            assert!(n > 0, "screen closed before {:?} appeared", needle);
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("timed out waiting for output");
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_exit_status_reaches_master() {
    let config = ProxyConfig::default();
    let (master, slave) = connect(&config, CommandSpec::new("sh").arg("-c").arg("exit 7")).await;
    let pty = slave.pty();

    let (_user, input) = duplex(1024);
    let (output, _screen) = duplex(64 * 1024);
    let (_events_tx, events_rx) = mpsc::channel(4);

    let (master_outcome, slave_outcome) = tokio::time::timeout(
        TIMEOUT,
        async { tokio::join!(master.run(input, output, events_rx), slave.run()) },
    )
    .await
    .unwrap();

    assert_eq!(master_outcome, SessionOutcome::Exited(7));
    assert_eq!(slave_outcome, SessionOutcome::Exited(7));
    assert!(pty.is_released());
    assert_eq!(pty.exit_status(), Some(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_is_drained_before_exit() {
    let config = ProxyConfig::default();
    let command = CommandSpec::new("sh").arg("-c").arg("printf 'last words'; exit 0");
    let (master, slave) = connect(&config, command).await;

    let (_user, input) = duplex(1024);
    let (output, mut screen) = duplex(64 * 1024);
    let (_events_tx, events_rx) = mpsc::channel(4);

    let slave_task = tokio::spawn(slave.run());
    let outcome = tokio::time::timeout(TIMEOUT, master.run(input, output, events_rx))
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Exited(0));

    let mut shown = Vec::new();
    screen.read_to_end(&mut shown).await.unwrap();
    assert!(String::from_utf8_lossy(&shown).contains("last words"));

    assert_eq!(slave_task.await.unwrap(), SessionOutcome::Exited(0));
}

async fn echo_through_cat(config: ProxyConfig) {
    let (master, slave) = connect(&config, CommandSpec::new("cat")).await;
    let pty = slave.pty();

    let (mut user, input) = duplex(1024);
    let (output, mut screen) = duplex(64 * 1024);
    let (_events_tx, events_rx) = mpsc::channel(4);

    let slave_task = tokio::spawn(slave.run());
    let master_task = tokio::spawn(master.run(input, output, events_rx));

    user.write_all(b"hello\n").await.unwrap();
    read_until(&mut screen, b"hello").await;

    // closing local input ends the master, which closes the transport
    drop(user);
    let master_outcome = tokio::time::timeout(TIMEOUT, master_task).await.unwrap().unwrap();
    assert_eq!(master_outcome, SessionOutcome::LocalClosed);

    let slave_outcome = tokio::time::timeout(TIMEOUT, slave_task).await.unwrap().unwrap();
    assert!(matches!(slave_outcome, SessionOutcome::TransportError(_)));
    assert!(pty.is_released());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_raw_payloads() {
    echo_through_cat(ProxyConfig::default()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_base64_payloads() {
    let mut config = ProxyConfig::default();
    config.protocol.payload_encoding = PayloadEncoding::Base64;
    config.protocol.max_payload_size = 64;
    echo_through_cat(config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abrupt_transport_close_releases_pty() {
    let config = ProxyConfig::default();
    let ((m_read, m_write), (s_read, s_write)) = transport();

    let peer = tokio::spawn(async move {
        MasterSession::establish(m_read, m_write, &ProxyConfig::default(), false)
            .await
            .unwrap()
    });
    let slave = SlaveSession::establish(
        s_read,
        s_write,
        &config,
        &CommandSpec::new("sleep").arg("30"),
    )
    .await
    .unwrap();
    let pty = slave.pty();
    let control = slave.control();

    // master vanishes without a word
    drop(peer.await.unwrap());

    let outcome = tokio::time::timeout(TIMEOUT, slave.run()).await.unwrap();
    assert!(matches!(outcome, SessionOutcome::TransportError(_)));
    assert_eq!(control.state(), SessionState::Closed);
    assert!(pty.is_released());
    assert!(pty.exit_status().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resize_reaches_pty() {
    let config = ProxyConfig::default();
    let (master, slave) = connect(&config, CommandSpec::new("sleep").arg("30")).await;
    let pty = slave.pty();
    assert_eq!(pty.size().unwrap(), TerminalSize::new(24, 80));

    let (user, input) = duplex(1024);
    let (output, _screen) = duplex(64 * 1024);
    let (events_tx, events_rx) = mpsc::channel(4);

    let slave_task = tokio::spawn(slave.run());
    let master_task = tokio::spawn(master.run(input, output, events_rx));

    events_tx
        .send(LocalEvent::Resize(TerminalSize::new(40, 120)))
        .await
        .unwrap();

    tokio::time::timeout(TIMEOUT, async {
        while pty.size().unwrap() != TerminalSize::new(40, 120) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("resize never applied");

    drop(user);
    tokio::time::timeout(TIMEOUT, master_task).await.unwrap().unwrap();
    tokio::time::timeout(TIMEOUT, slave_task).await.unwrap().unwrap();
    assert!(pty.is_released());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signal_from_master_stops_child() {
    let config = ProxyConfig::default();
    let (master, slave) = connect(&config, CommandSpec::new("sleep").arg("30")).await;

    let (_user, input) = duplex(1024);
    let (output, _screen) = duplex(64 * 1024);
    let (events_tx, events_rx) = mpsc::channel(4);

    let slave_task = tokio::spawn(slave.run());
    events_tx
        .send(LocalEvent::Signal(libc::SIGTERM as u8))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(TIMEOUT, master.run(input, output, events_rx))
        .await
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::Exited(status) if status != 0));
    assert_eq!(slave_task.await.unwrap(), outcome);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_signal_on_slave() {
    let config = ProxyConfig::default();
    let (master, slave) = connect(&config, CommandSpec::new("sleep").arg("30")).await;
    let signals = slave.signal_sender();

    let (_user, input) = duplex(1024);
    let (output, _screen) = duplex(64 * 1024);
    let (_events_tx, events_rx) = mpsc::channel(4);

    let slave_task = tokio::spawn(slave.run());
    signals.send(libc::SIGKILL).await.unwrap();

    let outcome = tokio::time::timeout(TIMEOUT, master.run(input, output, events_rx))
        .await
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::Exited(_)));
    assert_eq!(slave_task.await.unwrap(), outcome);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_greeting_and_raw_mode() {
    let mut config = ProxyConfig::default();
    config.slave.greeting = true;
    config.slave.raw_mode = true;

    let (master, slave) = connect(&config, CommandSpec::new("sh").arg("-c").arg("exit 3")).await;
    assert!(slave.pty().is_raw());

    let (_user, input) = duplex(1024);
    let (output, _screen) = duplex(64 * 1024);
    let (_events_tx, events_rx) = mpsc::channel(4);

    let (master_outcome, _) = tokio::time::timeout(
        TIMEOUT,
        async { tokio::join!(master.run(input, output, events_rx), slave.run()) },
    )
    .await
    .unwrap();
    assert_eq!(master_outcome, SessionOutcome::Exited(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_failure_is_setup_error() {
    let config = ProxyConfig::default();
    let ((_m_read, _m_write), (s_read, s_write)) = transport();

    let result = SlaveSession::establish(
        s_read,
        s_write,
        &config,
        &CommandSpec::new("/nonexistent/pty-proxy-test"),
    )
    .await;
    assert!(matches!(
        result,
        Err(SessionError::Pty(PtyError::SpawnFailed { .. }))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mismatched_encoding_is_protocol_error() {
    let raw = ProxyConfig::default();
    let mut encoded = ProxyConfig::default();
    encoded.protocol.payload_encoding = PayloadEncoding::Base64;

    let ((m_read, m_write), (s_read, s_write)) = transport();
    let cmd = CommandSpec::new("cat");
    let (master, slave) = tokio::join!(
        MasterSession::establish(m_read, m_write, &raw, false),
        SlaveSession::establish(s_read, s_write, &encoded, &cmd),
    );
    let (master, slave) = (master.unwrap(), slave.unwrap());

    let (mut user, input) = duplex(1024);
    let (output, _screen) = duplex(64 * 1024);
    let (_events_tx, events_rx) = mpsc::channel(4);

    let slave_task = tokio::spawn(slave.run());
    let master_task = tokio::spawn(master.run(input, output, events_rx));

    // raw bytes that are not valid base64
    user.write_all(b"#!\n").await.unwrap();

    let slave_outcome = tokio::time::timeout(TIMEOUT, slave_task).await.unwrap().unwrap();
    assert!(matches!(slave_outcome, SessionOutcome::ProtocolError(_)));

    let master_outcome = tokio::time::timeout(TIMEOUT, master_task).await.unwrap().unwrap();
    assert!(matches!(master_outcome, SessionOutcome::TransportError(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exactly_one_exit_frame_and_nothing_after() {
    let command = CommandSpec::new("sh").arg("-c").arg("printf done; exit 4");
    let (slave, mut peer_reader, _peer_writer) = connect_slave(command).await;

    let slave_task = tokio::spawn(slave.run());
    let frames = tokio::time::timeout(TIMEOUT, collect_frames(&mut peer_reader))
        .await
        .unwrap();

    assert_eq!(exit_frames(&frames), vec![4]);
    assert_eq!(frames.last(), Some(&Frame::Exit(4)));
    assert_eq!(slave_task.await.unwrap(), SessionOutcome::Exited(4));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transport_close_racing_child_exit_sends_at_most_one_exit() {
    for delay_ms in [150u64, 200, 250] {
        let command = CommandSpec::new("sh").arg("-c").arg("sleep 0.2; exit 3");
        let (slave, mut peer_reader, peer_writer) = connect_slave(command).await;
        let control = slave.control();

        let slave_task = tokio::spawn(slave.run());
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        drop(peer_writer);

        let frames = tokio::time::timeout(TIMEOUT, collect_frames(&mut peer_reader))
            .await
            .unwrap();
        let outcome = tokio::time::timeout(TIMEOUT, slave_task).await.unwrap().unwrap();

        match outcome {
            SessionOutcome::Exited(3) => assert_eq!(exit_frames(&frames), vec![3]),
            SessionOutcome::TransportError(_) => assert!(exit_frames(&frames).is_empty()),
            other => panic!("unexpected outcome {:?} after {}ms", other, delay_ms),
        }
        assert_eq!(control.state(), SessionState::Closed);
    }
}
