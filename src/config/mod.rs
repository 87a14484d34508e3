//! Configuration Management Module
//!
//! Saved connection targets and command snippets, their persistence in a
//! preference store, and the local vault that encrypts their secret fields.

pub mod builder;
pub mod storage;
pub mod types;
pub mod vault;

pub use builder::{ConfigDraft, ConfigError};
pub use storage::{
    config_dir, key_file, load_commands, load_configs, preferences_file, save_commands,
    save_configs, FilePreferences, MemoryPreferences, PreferenceStore, StorageError, COMMANDS_KEY,
    SESSIONS_KEY,
};
pub use types::{Command, Config, ConfigKind, DockerConfig, KubeConfig, SshConfig, DEFAULT_SSH_PORT};
pub use vault::{CredentialVault, VaultError};
