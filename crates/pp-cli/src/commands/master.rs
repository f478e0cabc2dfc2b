//! `pty-proxy master`

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::mpsc;

use pp_core::{CommandSpec, ProxyConfig};
use pp_session::session::EVENT_CHANNEL_CAPACITY;
use pp_session::{MasterSession, SessionOutcome};

use crate::output::print_warning;
use crate::terminal::{spawn_resize_watcher, RawModeGuard};

/// How long to wait for the slave process after the session ends
const SLAVE_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Launch the slave command and drive it from this terminal
///
/// Returns the exit code for this process.
pub async fn master_command(
    config: ProxyConfig,
    expect_greeting: bool,
    slave: CommandSpec,
) -> Result<i32> {
    tracing::info!("Launching slave: {}", slave);

    let mut command = Command::new(&slave.program);
    command
        .args(&slave.args)
        .envs(slave.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(cwd) = &slave.cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to launch slave '{}'", slave))?;

    let transport_write = child.stdin.take().context("Slave stdin was not captured")?;
    let transport_read = child.stdout.take().context("Slave stdout was not captured")?;

    let session = MasterSession::establish(transport_read, transport_write, &config, expect_greeting)
        .await
        .context("Session setup failed")?;

    let raw_guard = RawModeGuard::enable_if_tty().context("Failed to enter raw mode")?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    if raw_guard.is_some() {
        spawn_resize_watcher(events_tx).context("Failed to watch window size")?;
    } else {
        drop(events_tx);
    }

    let outcome = session
        .run(tokio::io::stdin(), tokio::io::stdout(), events_rx)
        .await;
    drop(raw_guard);
    if let Some(warning) = abnormal_end(&outcome) {
        print_warning(&warning);
    }

    match tokio::time::timeout(SLAVE_EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("Slave process exited: {}", status),
        Ok(Err(e)) => tracing::warn!("Failed to wait for slave process: {}", e),
        Err(_) => {
            tracing::debug!("Slave process still running, killing it");
            let _ = child.kill().await;
        }
    }

    tracing::info!("Session ended: {}", outcome);
    Ok(outcome.exit_code())
}

/// Message for sessions that ended without the remote child exiting
fn abnormal_end(outcome: &SessionOutcome) -> Option<String> {
    match outcome {
        SessionOutcome::Exited(_) | SessionOutcome::LocalClosed => None,
        SessionOutcome::TransportError(reason) => Some(format!("Lost connection to slave: {}", reason)),
        SessionOutcome::ProtocolError(reason) => Some(format!("Slave sent invalid data: {}", reason)),
    }
}
