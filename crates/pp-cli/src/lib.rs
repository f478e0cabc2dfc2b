//! pty-proxy CLI
//!
//! Provides the `pty-proxy` binary: `master` drives a session from the
//! user's terminal, `slave` hosts the PTY side over its own stdin/stdout.

pub mod commands;
pub mod output;
pub mod terminal;
