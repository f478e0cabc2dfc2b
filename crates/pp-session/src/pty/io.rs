//! Blocking PTY handles bridged onto tokio channels
//!
//! portable-pty only hands out blocking `Read`/`Write` objects, so each one
//! gets a dedicated blocking task.

use std::io::{Read, Write};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the channels between the PTY threads and the pumps
pub const PTY_CHANNEL_CAPACITY: usize = 64;

/// Read from the PTY in chunks of at most `chunk_size` bytes
///
/// The channel closes when the PTY reports EOF. On Linux that shows up as
/// EIO once the last slave descriptor is gone.
pub fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    chunk_size: usize,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; chunk_size.max(1)];

        loop {
            if cancel.is_cancelled() {
                tracing::debug!("PTY reader cancelled");
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        tracing::debug!("PTY output channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if is_eof(&e) || cancel.is_cancelled() {
                        tracing::debug!("PTY reader closed: {}", e);
                    } else {
                        tracing::error!("PTY read error: {}", e);
                    }
                    break;
                }
            }
        }
    })
}

/// Write every chunk received on `rx` to the PTY, in order
///
/// Stops when the channel closes or a write fails; the pump notices the
/// latter when its sends start failing.
pub fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Bytes>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                if is_eof(&e) {
                    tracing::debug!("PTY writer closed: {}", e);
                } else {
                    tracing::warn!("PTY write error: {}", e);
                }
                break;
            }
        }
        tracing::debug!("PTY writer exiting");
    })
}

fn is_eof(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
    )
}
