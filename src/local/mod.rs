//! Local Terminal Module
//!
//! Runs the user's shell on a local pseudo-terminal.

pub mod backend;
pub mod pty;
pub mod shell;

pub use backend::LocalBackend;
pub use pty::{PtyConfig, PtyError, PtyHandle};
pub use shell::{resolve_shell, ShellInfo};
