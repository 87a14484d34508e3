//! PTY (Pseudo-Terminal) wrapper
//!
//! Wraps portable-pty: opens a pair, spawns the shell on the slave side and
//! keeps the master, child and writer together so the whole process group
//! can be torn down at once.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};

use super::shell::ShellInfo;
use crate::backend::TermSize;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to create PTY: {0}")]
    CreateFailed(String),

    #[error("Failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PTY system error: {0}")]
    System(String),
}

/// Configuration for a new PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub size: TermSize,
    pub shell: ShellInfo,
    pub cwd: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
}

impl PtyConfig {
    pub fn new(shell: ShellInfo) -> Self {
        Self {
            size: TermSize::default(),
            shell,
            cwd: None,
            env: Vec::new(),
        }
    }
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A running shell on a PTY.
///
/// The reader is handed out separately at creation so a blocking read pump
/// can own it; everything else stays here and is released on drop.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

impl PtyHandle {
    /// Open a PTY and spawn the configured shell on it
    pub fn spawn(config: PtyConfig) -> Result<(Self, Box<dyn Read + Send>), PtyError> {
        let pair = native_pty_system()
            .openpty(pty_size(config.size))
            .map_err(|e| PtyError::CreateFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.shell.path);
        for arg in &config.shell.args {
            cmd.arg(arg);
        }

        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        } else if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }

        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        tracing::info!(
            "Spawning PTY shell: {:?} {:?} ({}x{})",
            config.shell.path,
            config.shell.args,
            config.size.cols,
            config.size.rows
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            tracing::error!("Failed to spawn PTY shell: {}", e);
            PtyError::SpawnFailed(e.to_string())
        })?;

        tracing::info!("PTY shell spawned, PID: {:?}", child.process_id());

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::System(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::System(format!("Failed to take writer: {}", e)))?;

        Ok((
            Self {
                master: pair.master,
                child,
                writer,
            },
            reader,
        ))
    }

    pub fn resize(&self, size: TermSize) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::System(e.to_string()))
    }

    /// Write input to the shell
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) -> Result<(), PtyError> {
        self.child
            .kill()
            .map_err(|e| PtyError::System(e.to_string()))
    }

    /// Kill the shell and everything it started (vim, top, ...)
    #[cfg(unix)]
    pub fn kill_process_group(&mut self) -> Result<(), PtyError> {
        let Some(pid) = self.pid() else {
            return self.kill();
        };

        // The shell leads its own session, so its PID is the PGID
        let pgid = Pid::from_raw(pid as i32);
        tracing::debug!("Killing process group {}", pid);

        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            tracing::debug!("SIGTERM to process group {} failed: {}", pid, e);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            tracing::debug!("SIGKILL to process group {} (may have already exited): {}", pid, e);
        }

        // Reap
        let _ = self.child.try_wait();
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn kill_process_group(&mut self) -> Result<(), PtyError> {
        self.kill()
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        tracing::debug!("Dropping PTY, killing process group");
        let _ = self.kill_process_group();
    }
}
