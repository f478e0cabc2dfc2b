//! Pseudo-terminal management
//!
//! [`PtyManager`] allocates PTY pairs through portable-pty. A [`Pty`] owns
//! the master side and at most one child process spawned on the slave side.
//! [`io`] bridges the blocking PTY handles onto tokio channels.

pub mod io;
mod manager;

pub use manager::{ChildHandle, Pty, PtyManager};
