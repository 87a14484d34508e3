//! termhub: uniform terminal sessions over local shells, SSH hosts,
//! container exec and cluster exec, with vault-encrypted saved credentials.
//!
//! ```text
//! config (vault, Config, store) ──► backend (local | ssh | container | cluster)
//!                                        │ open()
//!                                        ▼
//!                              session (TerminalSession, SessionRegistry)
//! ```

pub mod backend;
pub mod cluster;
pub mod config;
pub mod container;
#[cfg(feature = "local-terminal")]
pub mod local;
pub mod session;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// The filter comes from `TERMHUB_LOG`, then `RUST_LOG`, then `info`.
/// Calling this more than once is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("TERMHUB_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
