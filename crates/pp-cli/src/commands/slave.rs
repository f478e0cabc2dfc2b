//! `pty-proxy slave`

use anyhow::{Context, Result};

use pp_core::{CommandSpec, ProxyConfig};
use pp_session::SlaveSession;

use crate::terminal::{spawn_signal_forwarder, RawModeGuard};

/// Host `command` on a PTY, speaking the protocol over stdin/stdout
///
/// Returns the exit code for this process.
pub async fn slave_command(config: ProxyConfig, command: Option<CommandSpec>) -> Result<i32> {
    let command = config.slave.resolved_command(command);

    // a terminal on stdin would otherwise echo the master's frames back
    let raw_guard = RawModeGuard::enable_if_tty().context("Failed to enter raw mode")?;

    let session = SlaveSession::establish(
        tokio::io::stdin(),
        tokio::io::stdout(),
        &config,
        &command,
    )
    .await
    .with_context(|| format!("Failed to start session for '{}'", command))?;

    spawn_signal_forwarder(session.signal_sender()).context("Failed to install signal handlers")?;

    let outcome = session.run().await;
    drop(raw_guard);

    tracing::info!("Session ended: {}", outcome);
    Ok(outcome.exit_code())
}
