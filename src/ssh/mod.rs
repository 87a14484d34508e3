//! SSH module - interactive shells over SSH using russh
//!
//! - Password authentication with vault-held credentials
//! - PTY with echo disabled and default 80x24 geometry
//! - Host key verification via ~/.ssh/known_hosts

mod client;
pub mod known_hosts;

pub use client::{ClientHandler, HostKeyPolicy, SshBackend, SshOptions};
pub use known_hosts::{HostKeyVerification, KnownHosts};
