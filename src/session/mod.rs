//! Session Management Module
//!
//! - `TerminalSession`: one open backend stream with send/resize/close and
//!   config-change/close listener fan-out
//! - `SessionStateMachine`: Opening → Open → Closing → Closed
//! - `SessionRegistry`: saved Configs and Commands plus the live sessions

mod registry;
mod state;
mod terminal;

pub use registry::{PendingOpen, SessionRegistry};
pub use state::{SessionState, SessionStateMachine, StateTransitionError};
pub use terminal::{CloseReason, SessionInfo, TermConfig, TerminalSession, TerminalSink};

use crate::backend::{BackendError, StreamError};
use crate::config::{ConfigError, ConfigKind, StorageError, VaultError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Config not found: {0}")]
    ConfigNotFound(String),

    #[error("Command index {0} out of range")]
    CommandNotFound(usize),

    /// Container and cluster configs need a target picked first
    #[error("A {0} config needs a target selection before opening")]
    SelectionRequired(ConfigKind),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}
