//! PTY allocation and child process control

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, PtySystem, SlavePty};

use pp_core::CommandSpec;
use pp_protocol::TerminalSize;

use crate::error::PtyError;

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Allocates pseudo-terminals on the local machine
pub struct PtyManager {
    pty_system: Box<dyn PtySystem + Send>,
}

impl PtyManager {
    /// Create a manager backed by the platform's native PTY system
    pub fn new() -> Self {
        Self {
            pty_system: native_pty_system(),
        }
    }

    /// Open a new PTY pair with the given window size
    pub fn allocate(&self, size: TerminalSize) -> Result<Pty, PtyError> {
        tracing::debug!("Allocating PTY with size {}x{}", size.cols, size.rows);

        let pair = self
            .pty_system
            .openpty(pty_size(size))
            .map_err(|e| PtyError::AllocationFailed(e.to_string()))?;

        Ok(Pty {
            master: Mutex::new(Some(pair.master)),
            slave: Mutex::new(Some(pair.slave)),
            child: Mutex::new(None),
            pid: OnceLock::new(),
            exit_status: OnceLock::new(),
            #[cfg(unix)]
            saved_termios: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies the child attached to a PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildHandle {
    /// OS process id, when the platform reports one
    pub pid: Option<u32>,
    /// Program that was started
    pub program: String,
}

/// A pseudo-terminal and the child running on it
///
/// All methods take `&self` so the handle can be shared between the two
/// pumps of a session. [`Pty::release`] tears everything down exactly once;
/// dropping the handle releases it as well.
pub struct Pty {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Held until a child is attached, then dropped so the master sees EOF
    /// once the child exits
    slave: Mutex<Option<Box<dyn SlavePty + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: OnceLock<u32>,
    exit_status: OnceLock<i32>,
    #[cfg(unix)]
    saved_termios: Mutex<Option<libc::termios>>,
    released: AtomicBool,
}

impl Pty {
    /// Spawn `command` with the slave side as its controlling terminal
    ///
    /// On failure the PTY stays valid and must still be released by the caller.
    pub fn attach_child(&self, command: &CommandSpec) -> Result<ChildHandle, PtyError> {
        if self.is_released() {
            return Err(PtyError::Released);
        }

        let mut child_slot = lock(&self.child);
        if child_slot.is_some() {
            return Err(PtyError::AlreadyAttached);
        }

        let mut slave_slot = lock(&self.slave);
        let slave = slave_slot.as_ref().ok_or(PtyError::AlreadyAttached)?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &command.cwd {
            cmd.cwd(cwd);
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed {
                program: command.program.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.process_id();
        tracing::info!("Spawned '{}' with PID {:?}", command, pid);

        if let Some(pid) = pid {
            let _ = self.pid.set(pid);
        }
        *child_slot = Some(child);
        slave_slot.take();

        Ok(ChildHandle {
            pid,
            program: command.program.clone(),
        })
    }

    /// Clone a blocking reader over the master side
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        let guard = lock(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Released)?;
        master
            .try_clone_reader()
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Take the blocking writer for the master side (once only)
    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        let guard = lock(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Released)?;
        master
            .take_writer()
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Change the window size and tell the child about it
    ///
    /// SIGWINCH delivery is best effort; only the size change itself can fail.
    pub fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        {
            let guard = lock(&self.master);
            let master = guard.as_ref().ok_or(PtyError::Released)?;
            master
                .resize(pty_size(size))
                .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        }

        tracing::debug!("Resized PTY to {}x{}", size.cols, size.rows);

        #[cfg(unix)]
        if self.running_pid().is_some() {
            if let Err(e) = self.signal(libc::SIGWINCH) {
                tracing::debug!("SIGWINCH not delivered: {}", e);
            }
        }

        Ok(())
    }

    /// Current window size
    pub fn size(&self) -> Result<TerminalSize, PtyError> {
        let guard = lock(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Released)?;
        let size = master
            .get_size()
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?;
        Ok(TerminalSize::new(size.rows, size.cols))
    }

    /// Send a signal to the child
    #[cfg(unix)]
    pub fn signal(&self, signal: i32) -> Result<(), PtyError> {
        let pid = self.running_pid().ok_or(PtyError::NoChild)?;

        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            return Err(PtyError::SignalFailed {
                signal,
                source: std::io::Error::last_os_error(),
            });
        }

        tracing::debug!("Delivered signal {} to PID {}", signal, pid);
        Ok(())
    }

    /// Send a signal to the child
    #[cfg(not(unix))]
    pub fn signal(&self, signal: i32) -> Result<(), PtyError> {
        Err(PtyError::SignalFailed {
            signal,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "signals are not supported on this platform",
            ),
        })
    }

    /// Non-blocking check for child exit
    ///
    /// Once an exit status has been observed it is returned on every
    /// subsequent call.
    pub fn try_wait(&self) -> Result<Option<i32>, PtyError> {
        if let Some(status) = self.exit_status.get() {
            return Ok(Some(*status));
        }

        let mut guard = lock(&self.child);
        let child = guard.as_mut().ok_or(PtyError::NoChild)?;

        match child.try_wait()? {
            Some(status) => {
                let code = status.exit_code() as i32;
                let _ = self.exit_status.set(code);
                tracing::info!("Child exited with code {}", code);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Put the line discipline into (or take it out of) raw mode
    #[cfg(unix)]
    pub fn set_raw_mode(&self, raw: bool) -> Result<(), PtyError> {
        let guard = lock(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Released)?;
        let fd = master.as_raw_fd().ok_or_else(|| {
            PtyError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "PTY has no file descriptor",
            ))
        })?;

        let mut saved = lock(&self.saved_termios);
        if raw {
            if saved.is_some() {
                return Ok(());
            }
            let original = termios::get(fd)?;
            let mut attrs = original;
            // SAFETY: attrs is a valid, initialized termios
            unsafe { libc::cfmakeraw(&mut attrs) };
            termios::set(fd, &attrs)?;
            *saved = Some(original);
            tracing::debug!("PTY switched to raw mode");
        } else if let Some(original) = saved.take() {
            termios::set(fd, &original)?;
            tracing::debug!("PTY restored to cooked mode");
        }

        Ok(())
    }

    /// Put the line discipline into (or take it out of) raw mode
    #[cfg(not(unix))]
    pub fn set_raw_mode(&self, _raw: bool) -> Result<(), PtyError> {
        Err(PtyError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "raw mode is not supported on this platform",
        )))
    }

    /// Whether [`Pty::set_raw_mode`] is in effect
    pub fn is_raw(&self) -> bool {
        #[cfg(unix)]
        {
            lock(&self.saved_termios).is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// PID of the attached child, if any
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Exit status, once the child has been observed to exit
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status.get().copied()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Terminate the child if still running, reap it and close the PTY
    ///
    /// Returns true only for the call that performed the release.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        #[cfg(unix)]
        if let Err(e) = self.set_raw_mode(false) {
            tracing::debug!("Could not restore PTY mode: {}", e);
        }

        if let Some(mut child) = lock(&self.child).take() {
            let status = match child.try_wait() {
                Ok(Some(status)) => Some(status),
                _ => {
                    tracing::debug!("Terminating child {:?}", self.pid());
                    if let Err(e) = child.kill() {
                        tracing::debug!("Kill failed: {}", e);
                    }
                    match child.wait() {
                        Ok(status) => Some(status),
                        Err(e) => {
                            tracing::warn!("Failed to reap child {:?}: {}", self.pid(), e);
                            None
                        }
                    }
                }
            };
            if let Some(status) = status {
                let _ = self.exit_status.set(status.exit_code() as i32);
            }
        }

        lock(&self.slave).take();
        lock(&self.master).take();

        tracing::debug!("PTY released (exit status {:?})", self.exit_status());
        true
    }

    #[cfg(unix)]
    fn running_pid(&self) -> Option<u32> {
        if self.exit_status.get().is_some() || self.is_released() {
            return None;
        }
        self.pid()
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty")
            .field("pid", &self.pid())
            .field("exit_status", &self.exit_status())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(unix)]
mod termios {
    use std::io;
    use std::os::unix::io::RawFd;

    pub fn get(fd: RawFd) -> io::Result<libc::termios> {
        // SAFETY: termios is plain old data; tcgetattr fills it in
        let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut attrs) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(attrs)
    }

    pub fn set(fd: RawFd, attrs: &libc::termios) -> io::Result<()> {
        // SAFETY: attrs points to a valid termios
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, attrs) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
