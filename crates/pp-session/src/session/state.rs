//! Session lifecycle state shared by both pumps

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use pp_protocol::ProtocolError;

/// Exit code reported when the transport fails
pub const TRANSPORT_FAILURE_CODE: i32 = 255;

/// Exit code reported when the peer violates the protocol
pub const PROTOCOL_FAILURE_CODE: i32 = 254;

/// Lifecycle state of a session
///
/// States only move forward: `Handshaking -> Active -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Handshaking,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The child exited with this status
    Exited(i32),
    /// Local input reached end of stream
    LocalClosed,
    /// The byte stream to the peer failed or closed early
    TransportError(String),
    /// The peer sent something this side cannot accept
    ProtocolError(String),
}

impl SessionOutcome {
    /// Classify a protocol-layer failure
    pub fn from_error(error: &ProtocolError) -> Self {
        if error.is_transport() {
            SessionOutcome::TransportError(error.to_string())
        } else {
            SessionOutcome::ProtocolError(error.to_string())
        }
    }

    /// Process exit code a front end should report for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Exited(status) => *status,
            SessionOutcome::LocalClosed => 0,
            SessionOutcome::TransportError(_) => TRANSPORT_FAILURE_CODE,
            SessionOutcome::ProtocolError(_) => PROTOCOL_FAILURE_CODE,
        }
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::Exited(status) => write!(f, "child exited with status {}", status),
            SessionOutcome::LocalClosed => write!(f, "local input closed"),
            SessionOutcome::TransportError(reason) => write!(f, "transport error: {}", reason),
            SessionOutcome::ProtocolError(reason) => write!(f, "protocol error: {}", reason),
        }
    }
}

/// Shared termination state for one session
///
/// Whichever pump first observes a terminating condition calls
/// [`SessionControl::terminate`]; that call alone records the outcome and
/// cancels the other pump. Later calls are no-ops.
#[derive(Debug)]
pub struct SessionControl {
    state: AtomicU8,
    outcome: OnceLock<SessionOutcome>,
    cancel: CancellationToken,
}

impl SessionControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Handshaking as u8),
            outcome: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Handshaking -> Active`
    pub fn activate(&self) -> bool {
        self.advance(SessionState::Handshaking, SessionState::Active)
    }

    /// Move to `Closing` with the given outcome
    ///
    /// Returns true only for the call that won the transition.
    pub fn terminate(&self, outcome: SessionOutcome) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                tracing::trace!("Ignoring late termination: {}", outcome);
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        tracing::info!("Session closing: {}", outcome);
        let _ = self.outcome.set(outcome);
        self.cancel.cancel();
        true
    }

    /// `Closing -> Closed`, once both pumps have stopped
    pub fn close(&self) -> bool {
        self.advance(SessionState::Closing, SessionState::Closed)
    }

    /// Recorded outcome, once termination has happened
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome.get().cloned()
    }

    pub fn is_terminating(&self) -> bool {
        self.state() >= SessionState::Closing
    }

    /// Resolves once the session starts closing
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token cancelled when the session starts closing
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}
