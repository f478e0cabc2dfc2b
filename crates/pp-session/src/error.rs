//! Session and PTY error types

use thiserror::Error;

use pp_protocol::ProtocolError;

/// Errors raised by PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    /// The OS refused to create a pseudo-terminal pair
    #[error("PTY allocation failed: {0}")]
    AllocationFailed(String),

    /// The child could not be started; the PTY itself is still usable
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),

    #[error("Failed to deliver signal {signal}: {source}")]
    SignalFailed {
        signal: i32,
        #[source]
        source: std::io::Error,
    },

    /// No child is attached, or it has already been reaped
    #[error("No child process attached")]
    NoChild,

    /// A child is already attached to this PTY
    #[error("PTY already has a child attached")]
    AlreadyAttached,

    #[error("PTY already released")]
    Released,

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort session setup
///
/// Once a session is running, failures are reported through
/// [`SessionOutcome`](crate::SessionOutcome) instead.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Whether setup failed because the byte stream itself broke
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Protocol(e) if e.is_transport())
    }
}
