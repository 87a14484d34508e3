//! Session backends
//!
//! A backend is a ready-to-open connection target. Opening yields a
//! `DuplexStream` whose transport task owns the underlying resource (PTY,
//! SSH channel, container exec, cluster exec).
//!
//! ```text
//! Config ──► backend ──open()──► DuplexStream ──► TerminalSession
//!                                  │      ▲
//!                      StreamCommand      Result<Vec<u8>, StreamError>
//!                                  ▼      │
//!                               transport task (owns resource)
//! ```

pub mod error;
pub mod stream;

use async_trait::async_trait;
use tokio::sync::oneshot;

pub use error::BackendError;
pub use stream::{
    channel, spawn_io_transport, DuplexStream, NoResize, Resizer, StreamCommand, StreamError,
    StreamReader, StreamWriter, TermSize, TransportEnd,
};

#[async_trait]
pub trait SessionBackend: Send + 'static {
    /// Short transport label for logs ("local", "ssh", "docker", "k8s")
    fn kind(&self) -> &'static str;

    /// Establish the transport.
    ///
    /// On error, everything acquired by earlier stages of this attempt has
    /// already been released.
    async fn open(self: Box<Self>) -> Result<DuplexStream, BackendError>;
}

/// Run `backend.open()` on its own task. The caller gets the result through
/// the returned receiver and never waits on the open sequence itself.
pub fn open_in_background(
    backend: Box<dyn SessionBackend>,
) -> oneshot::Receiver<Result<DuplexStream, BackendError>> {
    let (tx, rx) = oneshot::channel();
    let kind = backend.kind();

    tokio::spawn(async move {
        tracing::debug!("Opening {} backend", kind);
        let result = backend.open().await;
        match &result {
            Ok(stream) => tracing::info!("{} backend opened stream {}", kind, stream.id()),
            Err(e) => tracing::warn!("{} backend failed to open: {}", kind, e),
        }

        // Receiver gone: the stream (if any) is dropped here, which closes it
        let _ = tx.send(result);
    });

    rx
}
