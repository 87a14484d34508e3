//! Local shell backend
//!
//! Two pumps per session:
//! - the transport task owns the PTY; it applies writes and resizes and
//!   kills the process group on close
//! - a blocking read pump owns the PTY reader and forwards output in
//!   UTF-8-safe chunks

use std::io::Read;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::pty::{PtyConfig, PtyHandle};
use super::shell::{resolve_shell, ShellInfo};
use crate::backend::{
    channel, BackendError, DuplexStream, SessionBackend, StreamCommand, StreamError, TermSize,
    TransportEnd,
};

const READ_BUFFER_SIZE: usize = 8192;

/// Opens a shell on a local PTY
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    shell: Option<ShellInfo>,
    size: TermSize,
    cwd: Option<std::path::PathBuf>,
}

impl LocalBackend {
    /// Use the resolved default shell at 80x24
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: ShellInfo) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[async_trait]
impl SessionBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn open(self: Box<Self>) -> Result<DuplexStream, BackendError> {
        let shell = match self.shell {
            Some(shell) => shell,
            None => resolve_shell().ok_or(BackendError::NoShell)?,
        };

        let mut config = PtyConfig::new(shell);
        config.size = self.size;
        config.cwd = self.cwd;

        // openpty/spawn block briefly
        let (pty, reader) = tokio::task::spawn_blocking(move || PtyHandle::spawn(config))
            .await
            .map_err(|e| BackendError::Pty(format!("spawn task failed: {}", e)))?
            .map_err(|e| BackendError::Shell(e.to_string()))?;

        let (stream, transport) = channel(uuid::Uuid::new_v4().to_string(), true);
        let TransportEnd {
            id,
            commands,
            output,
        } = transport;

        spawn_read_pump(id.clone(), reader, output);
        tokio::spawn(run_pty_transport(id, pty, commands));

        Ok(stream)
    }
}

async fn run_pty_transport(
    id: String,
    mut pty: PtyHandle,
    mut commands: mpsc::Receiver<StreamCommand>,
) {
    tracing::debug!("PTY transport started for stream {}", id);

    while let Some(cmd) = commands.recv().await {
        match cmd {
            StreamCommand::Data(data) => {
                if let Err(e) = pty.write_all(&data) {
                    if pty.is_alive() {
                        tracing::error!("Failed to write to PTY {}: {}", id, e);
                    } else {
                        tracing::info!("Shell on PTY {} has exited", id);
                    }
                    break;
                }
            }
            StreamCommand::Resize(size) => {
                if let Err(e) = pty.resize(size) {
                    tracing::warn!("Failed to resize PTY {}: {}", id, e);
                }
            }
            StreamCommand::Close => break,
        }
    }

    tracing::info!("Closing PTY stream {}", id);
    // kill_process_group sleeps between signals
    let _ = tokio::task::spawn_blocking(move || drop(pty)).await;
}

fn spawn_read_pump(
    id: String,
    mut reader: Box<dyn Read + Send>,
    output: mpsc::Sender<Result<Vec<u8>, StreamError>>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut remainder: Vec<u8> = Vec::new();

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("Read pump: PTY EOF on {}", id);
                    break;
                }
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    // EIO is how Linux reports a PTY whose shell has exited
                    tracing::debug!("Read pump error on {}: {}", id, e);
                    break;
                }
            };

            let mut chunk = if remainder.is_empty() {
                buf[..n].to_vec()
            } else {
                let mut combined = std::mem::take(&mut remainder);
                combined.extend_from_slice(&buf[..n]);
                combined
            };

            let safe_end = find_utf8_safe_boundary(&chunk);
            if safe_end < chunk.len() {
                remainder = chunk.split_off(safe_end);
            }

            if !chunk.is_empty() && output.blocking_send(Ok(chunk)).is_err() {
                tracing::debug!("Read pump: receiver dropped for {}", id);
                return;
            }
        }

        if !remainder.is_empty() {
            let _ = output.blocking_send(Ok(remainder));
        }
        tracing::info!("Local read pump exited for {}", id);
    });
}

/// Index up to which `buf` holds only complete UTF-8 sequences.
/// A trailing incomplete multi-byte sequence is excluded; invalid bytes are
/// passed through.
fn find_utf8_safe_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    let floor = len.saturating_sub(4);
    let mut i = len;

    while i > floor {
        let byte = buf[i - 1];

        if byte & 0x80 == 0 {
            return len;
        }
        if byte & 0xC0 == 0x80 {
            i -= 1;
            continue;
        }

        let needed = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => return len,
        };
        let start = i - 1;
        return if len - start >= needed { len } else { start };
    }

    len
}
