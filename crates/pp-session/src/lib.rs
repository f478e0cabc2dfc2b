//! pp-session: PTY management and session pumps for pty-proxy
//!
//! The slave side owns a [`pty::Pty`] with a child process attached and
//! relays its terminal I/O over a framed byte stream. The master side sits
//! at the user's terminal and relays keystrokes, window size changes and
//! signals the other way.
//!
//! Both sides are built in two steps: `establish` performs the handshake
//! (and, on the slave, allocates the PTY and spawns the child), then `run`
//! pumps frames until the session ends and reports a [`SessionOutcome`].

pub mod error;
pub mod pty;
pub mod session;

pub use error::{PtyError, SessionError};
pub use pty::{ChildHandle, Pty, PtyManager};
pub use session::{
    LocalEvent, MasterSession, SessionControl, SessionOutcome, SessionState, SlaveSession,
};
