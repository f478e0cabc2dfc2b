//! Local terminal handling: raw mode, window size and signal plumbing

use std::io::IsTerminal;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pp_protocol::TerminalSize;
use pp_session::LocalEvent;

/// Keeps the controlling terminal in raw mode until dropped
#[derive(Debug)]
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Switch to raw mode
    pub fn enable() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        tracing::debug!("Terminal switched to raw mode");
        Ok(Self { _private: () })
    }

    /// Switch to raw mode only when stdin is a terminal
    pub fn enable_if_tty() -> std::io::Result<Option<Self>> {
        if std::io::stdin().is_terminal() {
            Self::enable().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            tracing::warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Size of the controlling terminal, if there is one
pub fn local_size() -> Option<TerminalSize> {
    match crossterm::terminal::size() {
        Ok((cols, rows)) => Some(TerminalSize::new(rows, cols)),
        Err(e) => {
            tracing::debug!("Terminal size unavailable: {}", e);
            None
        }
    }
}

/// Send the current size now and again on every SIGWINCH
#[cfg(unix)]
pub fn spawn_resize_watcher(events: mpsc::Sender<LocalEvent>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = signal(SignalKind::window_change())?;

    Ok(tokio::spawn(async move {
        if let Some(size) = local_size() {
            if events.send(LocalEvent::Resize(size)).await.is_err() {
                return;
            }
        }
        while winch.recv().await.is_some() {
            let Some(size) = local_size() else { continue };
            tracing::debug!("Window resized to {}x{}", size.cols, size.rows);
            if events.send(LocalEvent::Resize(size)).await.is_err() {
                break;
            }
        }
    }))
}

/// Send the current size once
#[cfg(not(unix))]
pub fn spawn_resize_watcher(events: mpsc::Sender<LocalEvent>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if let Some(size) = local_size() {
            let _ = events.send(LocalEvent::Resize(size)).await;
        }
    }))
}

/// Relay SIGTERM, SIGHUP and SIGINT received by this process to the child
#[cfg(unix)]
pub fn spawn_signal_forwarder(signals: mpsc::Sender<i32>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let number = tokio::select! {
                Some(()) = term.recv() => SignalKind::terminate().as_raw_value(),
                Some(()) = hangup.recv() => SignalKind::hangup().as_raw_value(),
                Some(()) = interrupt.recv() => SignalKind::interrupt().as_raw_value(),
                else => break,
            };
            tracing::debug!("Forwarding signal {} to child", number);
            if signals.send(number).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_forwarder(_signals: mpsc::Sender<i32>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async {}))
}
