//! Terminal session: one open backend stream plus listener fan-out
//!
//! The read pump is the only consumer of stream output and hands every
//! chunk to the session's `TerminalSink` in order. Listener callbacks run on
//! a separate dispatcher task, in registration order.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{SessionState, SessionStateMachine};
use super::SessionError;
use crate::backend::{DuplexStream, StreamReader, StreamWriter, TermSize};
use crate::config::Config;

/// Receives session output, typically a terminal emulator
pub trait TerminalSink: Send + Sync + 'static {
    fn write(&self, data: &[u8]);
}

impl<F> TerminalSink for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn write(&self, data: &[u8]) {
        self(data)
    }
}

/// Title and geometry as reported by the emulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermConfig {
    pub title: String,
    pub rows: u16,
    pub cols: u16,
}

impl TermConfig {
    pub fn size(&self) -> TermSize {
        TermSize::new(self.cols, self.rows)
    }
}

impl Default for TermConfig {
    fn default() -> Self {
        let size = TermSize::default();
        Self {
            title: String::new(),
            rows: size.rows,
            cols: size.cols,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    User,
    /// The remote side finished
    StreamEnded,
    /// A read or write on the stream failed
    StreamError(String),
    /// The backend never opened
    OpenFailed(String),
}

impl CloseReason {
    fn error(&self) -> Option<String> {
        match self {
            CloseReason::StreamError(e) | CloseReason::OpenFailed(e) => Some(e.clone()),
            CloseReason::User | CloseReason::StreamEnded => None,
        }
    }
}

type ConfigListener = Arc<dyn Fn(&TermConfig) + Send + Sync>;
type CloseListener = Arc<dyn Fn(&CloseReason) + Send + Sync>;

struct CloseListeners {
    pending: Vec<CloseListener>,
    /// Set once; listeners registered afterwards run right away
    fired: Option<CloseReason>,
}

enum Dispatch {
    Config(Vec<ConfigListener>, TermConfig),
    Close(Vec<CloseListener>, CloseReason),
    /// Close listeners are done; the session can move to Closed
    Closed(Arc<Mutex<SessionStateMachine>>, CancellationToken),
}

/// Snapshot for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub state: SessionState,
    pub error: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub uptime_secs: u64,
}

struct Inner {
    id: String,
    name: String,
    config: Option<Arc<Config>>,
    state: Arc<Mutex<SessionStateMachine>>,
    writer: Mutex<Option<Arc<StreamWriter>>>,
    term_config: Mutex<TermConfig>,
    config_listeners: Mutex<Vec<ConfigListener>>,
    close_listeners: Mutex<CloseListeners>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    /// Stops the read pump
    cancel: CancellationToken,
    /// Cancelled once every close listener has run
    closed: CancellationToken,
    created_at: Instant,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping the writer releases the stream
        self.cancel.cancel();
    }
}

/// Cheap to clone; all clones are the same session
#[derive(Clone)]
pub struct TerminalSession {
    inner: Arc<Inner>,
}

impl TerminalSession {
    /// A session waiting for its backend. `config` is `None` for a local shell.
    pub fn new(config: Option<Arc<Config>>) -> Self {
        let name = config
            .as_ref()
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "local".to_string());

        let (dispatch, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(rx));

        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                name,
                config,
                state: Arc::new(Mutex::new(SessionStateMachine::new())),
                writer: Mutex::new(None),
                term_config: Mutex::new(TermConfig::default()),
                config_listeners: Mutex::new(Vec::new()),
                close_listeners: Mutex::new(CloseListeners {
                    pending: Vec::new(),
                    fired: None,
                }),
                dispatch,
                cancel: CancellationToken::new(),
                closed: CancellationToken::new(),
                created_at: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> Option<&Arc<Config>> {
        self.inner.config.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().state()
    }

    pub fn term_config(&self) -> TermConfig {
        self.inner.term_config.lock().clone()
    }

    pub fn info(&self) -> SessionInfo {
        let (state, error) = {
            let sm = self.inner.state.lock();
            (sm.state(), sm.error().map(String::from))
        };
        let term = self.term_config();
        SessionInfo {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            kind: self
                .inner
                .config
                .as_ref()
                .map(|c| c.kind().to_string())
                .unwrap_or_else(|| "local".to_string()),
            state,
            error,
            cols: term.cols,
            rows: term.rows,
            uptime_secs: self.inner.created_at.elapsed().as_secs(),
        }
    }

    /// Take ownership of an opened stream and start the read pump.
    ///
    /// If the session was closed while the backend was opening, the stream
    /// is released and `SessionError::Closed` returned.
    pub fn attach(&self, stream: DuplexStream, sink: Arc<dyn TerminalSink>) -> Result<(), SessionError> {
        let opened = self.inner.state.lock().open_success();
        if let Err(e) = opened {
            debug!("Session {} not attaching: {}", self.inner.id, e);
            stream.close();
            return Err(SessionError::Closed);
        }

        let (writer, reader) = stream.split();
        info!(
            "Session {} ({}) attached to stream {}",
            self.inner.id,
            self.inner.name,
            writer.id()
        );
        let writer = Arc::new(writer);
        *self.inner.writer.lock() = Some(writer.clone());
        if self.inner.cancel.is_cancelled() {
            // Closed between the state change and storing the writer
            drop(self.inner.writer.lock().take());
            return Err(SessionError::Closed);
        }

        // Geometry reported while opening never reached the backend
        let size = self.inner.term_config.lock().size();
        if size != TermSize::default() {
            if let Err(e) = writer.try_resize(size) {
                warn!("Initial resize failed on session {}: {}", self.inner.id, e);
            }
        }

        tokio::spawn(run_read_pump(
            Arc::downgrade(&self.inner),
            reader,
            sink,
            self.inner.cancel.clone(),
        ));
        Ok(())
    }

    /// Record a failed backend open; close listeners see `OpenFailed`
    pub fn fail_open(&self, error: impl std::fmt::Display) {
        self.inner.shutdown(CloseReason::OpenFailed(error.to_string()));
    }

    /// Send text as-is
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        self.send_bytes(text.as_bytes().to_vec()).await
    }

    /// Send raw bytes. A write failure closes the session.
    pub async fn send_bytes(&self, data: Vec<u8>) -> Result<(), SessionError> {
        let writer = self.inner.writer.lock().clone().ok_or(SessionError::Closed)?;
        if let Err(e) = writer.write(data).await {
            warn!("Write failed on session {}: {}", self.inner.id, e);
            self.inner.shutdown(CloseReason::StreamError(e.to_string()));
            return Err(SessionError::Stream(e));
        }
        Ok(())
    }

    /// Apply an emulator title/geometry change: resize the stream when the
    /// geometry moved, then notify config listeners.
    pub async fn update_config(&self, config: TermConfig) -> Result<(), SessionError> {
        let previous = std::mem::replace(&mut *self.inner.term_config.lock(), config.clone());

        if previous.size() != config.size() {
            let writer = self.inner.writer.lock().clone();
            if let Some(writer) = writer {
                if let Err(e) = writer.resize(config.size()).await {
                    self.inner.shutdown(CloseReason::StreamError(e.to_string()));
                    return Err(SessionError::Stream(e));
                }
            }
        }

        let listeners = self.inner.config_listeners.lock().clone();
        if !listeners.is_empty() {
            let _ = self.inner.dispatch.send(Dispatch::Config(listeners, config));
        }
        Ok(())
    }

    /// Resize keeping the current title
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let mut config = self.term_config();
        config.cols = cols;
        config.rows = rows;
        self.update_config(config).await
    }

    pub fn on_config_change(&self, listener: impl Fn(&TermConfig) + Send + Sync + 'static) {
        self.inner.config_listeners.lock().push(Arc::new(listener));
    }

    /// Register a close listener. Registering after the session closed runs
    /// it once with the original reason.
    pub fn on_close(&self, listener: impl Fn(&CloseReason) + Send + Sync + 'static) {
        let listener: CloseListener = Arc::new(listener);
        let mut listeners = self.inner.close_listeners.lock();
        match &listeners.fired {
            Some(reason) => {
                let _ = self
                    .inner
                    .dispatch
                    .send(Dispatch::Close(vec![listener], reason.clone()));
            }
            None => listeners.pending.push(listener),
        }
    }

    /// Close the stream and notify close listeners. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown(CloseReason::User);
    }

    /// Resolves once the session is closed and every close listener has run
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

impl Inner {
    fn shutdown(&self, reason: CloseReason) {
        if let Err(e) = self.state.lock().begin_close(reason.error()) {
            debug!("Session {} already closing ({}), ignoring {:?}", self.id, e, reason);
            return;
        }
        info!("Closing session {} ({:?})", self.id, reason);

        self.cancel.cancel();
        // An in-flight send may still hold a clone; the stream closes when it finishes
        drop(self.writer.lock().take());

        let listeners = {
            let mut listeners = self.close_listeners.lock();
            listeners.fired = Some(reason.clone());
            std::mem::take(&mut listeners.pending)
        };
        let _ = self.dispatch.send(Dispatch::Close(listeners, reason));
        let _ = self
            .dispatch
            .send(Dispatch::Closed(self.state.clone(), self.closed.clone()));
    }
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(event) = rx.recv().await {
        match event {
            Dispatch::Config(listeners, config) => {
                for listener in &listeners {
                    guarded("config", || listener(&config));
                }
            }
            Dispatch::Close(listeners, reason) => {
                for listener in &listeners {
                    guarded("close", || listener(&reason));
                }
            }
            Dispatch::Closed(state, closed) => {
                let _ = state.lock().close_complete();
                closed.cancel();
            }
        }
    }
}

/// A panicking listener must not take the dispatcher down with it
fn guarded(kind: &str, call: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
        error!("A {} listener panicked", kind);
    }
}

async fn run_read_pump(
    session: Weak<Inner>,
    mut reader: StreamReader,
    sink: Arc<dyn TerminalSink>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read() => match read {
                Ok(Some(data)) => sink.write(&data),
                Ok(None) => break CloseReason::StreamEnded,
                Err(e) => break CloseReason::StreamError(e.to_string()),
            },
        }
    };

    debug!("Read pump finished: {:?}", reason);
    if let Some(inner) = session.upgrade() {
        inner.shutdown(reason);
    }
}
