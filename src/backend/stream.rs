//! Duplex byte streams
//!
//! Every backend hands back the same shape: a command channel into a
//! transport task that owns the underlying resource, and an output channel
//! out of it. The transport task is the only place the resource is released,
//! which happens exactly once, when it sees `Close`, when every command
//! sender is gone, or when the remote end finishes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::BackendError;

const COMMAND_CAPACITY: usize = 1024;
const OUTPUT_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 8192;

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Commands accepted by a transport task
#[derive(Debug)]
pub enum StreamCommand {
    /// Bytes for the remote stdin
    Data(Vec<u8>),
    /// Resize the remote terminal
    Resize(TermSize),
    /// Release the transport
    Close,
}

/// Stream-level failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Stream closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Write half: input and control for the transport task
#[derive(Debug)]
pub struct StreamWriter {
    id: String,
    commands: mpsc::Sender<StreamCommand>,
    resizable: bool,
}

impl StreamWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn supports_resize(&self) -> bool {
        self.resizable
    }

    /// Queue bytes for the remote side
    pub async fn write(&self, data: Vec<u8>) -> Result<(), StreamError> {
        self.commands
            .send(StreamCommand::Data(data))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Request a resize. Streams without resize support ignore it.
    pub async fn resize(&self, size: TermSize) -> Result<(), StreamError> {
        if !self.resizable {
            return Ok(());
        }
        self.commands
            .send(StreamCommand::Resize(size))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Queue a resize without waiting. Fails if the command queue is full.
    pub fn try_resize(&self, size: TermSize) -> Result<(), StreamError> {
        if !self.resizable {
            return Ok(());
        }
        self.commands
            .try_send(StreamCommand::Resize(size))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => StreamError::Transport("command queue full".into()),
                mpsc::error::TrySendError::Closed(_) => StreamError::Closed,
            })
    }

    /// Ask the transport task to release its resources.
    pub fn close(self) {
        // Drop does the work
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        debug!("Dropping StreamWriter for stream {}", self.id);
        // If the queue is full the sender drop below still ends the transport
        let _ = self.commands.try_send(StreamCommand::Close);
    }
}

/// Read half: output of the transport task
#[derive(Debug)]
pub struct StreamReader {
    output: mpsc::Receiver<Result<Vec<u8>, StreamError>>,
}

impl StreamReader {
    /// Next chunk of output. `Ok(None)` once the stream has ended normally.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        match self.output.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// An open backend: a write half and a read half that can be split apart
#[derive(Debug)]
pub struct DuplexStream {
    writer: StreamWriter,
    reader: StreamReader,
}

impl DuplexStream {
    pub fn id(&self) -> &str {
        self.writer.id()
    }

    pub fn supports_resize(&self) -> bool {
        self.writer.supports_resize()
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<(), StreamError> {
        self.writer.write(data).await
    }

    pub async fn resize(&self, size: TermSize) -> Result<(), StreamError> {
        self.writer.resize(size).await
    }

    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        self.reader.read().await
    }

    /// Release the underlying transport
    pub fn close(self) {
        self.writer.close();
    }

    pub fn split(self) -> (StreamWriter, StreamReader) {
        (self.writer, self.reader)
    }
}

/// Transport-task side of a stream
pub struct TransportEnd {
    pub id: String,
    pub commands: mpsc::Receiver<StreamCommand>,
    pub output: mpsc::Sender<Result<Vec<u8>, StreamError>>,
}

/// Create a connected stream/transport pair
pub fn channel(id: impl Into<String>, resizable: bool) -> (DuplexStream, TransportEnd) {
    let id = id.into();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);

    let stream = DuplexStream {
        writer: StreamWriter {
            id: id.clone(),
            commands: cmd_tx,
            resizable,
        },
        reader: StreamReader { output: out_rx },
    };

    let transport = TransportEnd {
        id,
        commands: cmd_rx,
        output: out_tx,
    };

    (stream, transport)
}

/// Applies terminal geometry changes for an io-driven transport
#[async_trait]
pub trait Resizer: Send + 'static {
    async fn resize(&mut self, size: TermSize) -> Result<(), BackendError>;
}

/// Placeholder for transports with no resize support
pub struct NoResize;

#[async_trait]
impl Resizer for NoResize {
    async fn resize(&mut self, _size: TermSize) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Spawn a transport task pumping between an async reader/writer pair and a
/// `DuplexStream`. Used by transports whose client library exposes plain
/// async IO halves.
///
/// The reader, writer and resizer are dropped when the task ends, which is
/// what releases the remote exec.
pub fn spawn_io_transport<R, W, Z>(
    id: impl Into<String>,
    reader: R,
    writer: W,
    resizer: Option<Z>,
) -> DuplexStream
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    Z: Resizer,
{
    let (stream, transport) = channel(id, resizer.is_some());
    tokio::spawn(run_io_transport(transport, reader, writer, resizer));
    stream
}

async fn run_io_transport<R, W, Z>(
    transport: TransportEnd,
    mut reader: R,
    mut writer: W,
    mut resizer: Option<Z>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    Z: Resizer,
{
    let TransportEnd {
        id,
        mut commands,
        output,
    } = transport;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    debug!("IO transport started for stream {}", id);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(StreamCommand::Data(data)) => {
                        let result: std::io::Result<()> = async {
                            writer.write_all(&data).await?;
                            writer.flush().await
                        }
                        .await;
                        if let Err(e) = result {
                            warn!("Write failed on stream {}: {}", id, e);
                            let _ = output.send(Err(StreamError::Transport(e.to_string()))).await;
                            break;
                        }
                    }
                    Some(StreamCommand::Resize(size)) => {
                        if let Some(resizer) = resizer.as_mut() {
                            if let Err(e) = resizer.resize(size).await {
                                // Resize failures leave the stream usable
                                warn!("Resize to {}x{} failed on stream {}: {}", size.cols, size.rows, id, e);
                            }
                        }
                    }
                    Some(StreamCommand::Close) | None => {
                        info!("Close requested for stream {}", id);
                        break;
                    }
                }
            }

            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        info!("Stream {} reached EOF", id);
                        break;
                    }
                    Ok(n) => {
                        if output.send(Ok(buf[..n].to_vec())).await.is_err() {
                            debug!("Output receiver dropped for stream {}", id);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Read failed on stream {}: {}", id, e);
                        let _ = output.send(Err(StreamError::Transport(e.to_string()))).await;
                        break;
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    info!("IO transport terminated for stream {}", id);
}
