//! Config drafts
//!
//! A draft is the field set a form collects, as plain strings. `build`
//! creates a new Config; `apply_to` edits an existing one in place.
//!
//! Secret policy is the same for every variant: when creating, a blank
//! secret stores no secret; when editing, a blank secret keeps whatever is
//! stored. Drafts made from an existing Config start with a blank secret.

use super::types::{Config, DockerConfig, KubeConfig, SshConfig, DEFAULT_SSH_PORT};
use super::vault::{CredentialVault, VaultError};

/// Config validation/edit errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Name must not be empty")]
    EmptyName,

    #[error("Invalid port '{0}': expected a number between 1 and 65535")]
    InvalidPort(String),

    #[error("Cannot change config '{name}' from {from} to {to}")]
    KindMismatch {
        name: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Config '{0}' already exists")]
    Duplicate(String),

    #[error("Config '{0}' not found")]
    NotFound(String),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Form fields for a new or edited Config
#[derive(Clone, PartialEq, Eq)]
pub enum ConfigDraft {
    Ssh {
        name: String,
        host: String,
        port: String,
        user: String,
        password: String,
    },
    Docker {
        name: String,
        host: String,
    },
    Kube {
        name: String,
        server: String,
        token: String,
    },
}

impl std::fmt::Debug for ConfigDraft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigDraft::Ssh {
                name, host, port, user, ..
            } => f
                .debug_struct("Ssh")
                .field("name", name)
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .finish_non_exhaustive(),
            ConfigDraft::Docker { name, host } => f
                .debug_struct("Docker")
                .field("name", name)
                .field("host", host)
                .finish(),
            ConfigDraft::Kube { name, server, .. } => f
                .debug_struct("Kube")
                .field("name", name)
                .field("server", server)
                .finish_non_exhaustive(),
        }
    }
}

impl ConfigDraft {
    /// Empty SSH form with the default port filled in
    pub fn ssh() -> Self {
        ConfigDraft::Ssh {
            name: String::new(),
            host: String::new(),
            port: DEFAULT_SSH_PORT.to_string(),
            user: String::new(),
            password: String::new(),
        }
    }

    /// Form prefilled from an existing Config. Secrets are never prefilled.
    pub fn from_config(config: &Config) -> Self {
        match config {
            Config::Ssh(c) => ConfigDraft::Ssh {
                name: c.name.clone(),
                host: c.host.clone(),
                port: c.port.to_string(),
                user: c.user.clone(),
                password: String::new(),
            },
            Config::Docker(c) => ConfigDraft::Docker {
                name: c.name.clone(),
                host: c.host.clone(),
            },
            Config::Kube(c) => ConfigDraft::Kube {
                name: c.name.clone(),
                server: c.server.clone(),
                token: String::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConfigDraft::Ssh { name, .. }
            | ConfigDraft::Docker { name, .. }
            | ConfigDraft::Kube { name, .. } => name,
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            ConfigDraft::Ssh { .. } => "ssh",
            ConfigDraft::Docker { .. } => "docker",
            ConfigDraft::Kube { .. } => "k8s",
        }
    }

    /// Create a new Config. A blank secret stores no secret.
    pub fn build(&self, vault: &CredentialVault) -> Result<Config, ConfigError> {
        let name = self.name().trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let config = match self {
            ConfigDraft::Ssh {
                host,
                port,
                user,
                password,
                ..
            } => {
                let mut ssh = SshConfig::new(name, host.trim(), user.trim());
                ssh.port = parse_port(port)?;
                ssh.set_password(vault, password)?;
                Config::Ssh(ssh)
            }
            ConfigDraft::Docker { host, .. } => Config::Docker(DockerConfig::new(name, host.trim())),
            ConfigDraft::Kube { server, token, .. } => {
                let mut kube = KubeConfig::new(name, server.trim());
                kube.set_token(vault, token)?;
                Config::Kube(kube)
            }
        };

        tracing::debug!("Built {} config '{}'", config.kind(), config.name());
        Ok(config)
    }

    /// Apply edits to an existing Config.
    ///
    /// The name is immutable and the variant must match. A blank secret keeps
    /// the stored value. Nothing is modified if validation fails.
    pub fn apply_to(&self, config: &mut Config, vault: &CredentialVault) -> Result<(), ConfigError> {
        if config.kind().as_str() != self.kind_str() {
            return Err(ConfigError::KindMismatch {
                name: config.name().to_string(),
                from: config.kind().as_str(),
                to: self.kind_str(),
            });
        }

        match (self, config) {
            (
                ConfigDraft::Ssh {
                    host,
                    port,
                    user,
                    password,
                    ..
                },
                Config::Ssh(ssh),
            ) => {
                let port = parse_port(port)?;
                let encoded = encrypt_if_present(vault, password)?;
                ssh.host = host.trim().to_string();
                ssh.port = port;
                ssh.user = user.trim().to_string();
                if let Some(encoded) = encoded {
                    ssh.password = encoded;
                }
            }
            (ConfigDraft::Docker { host, .. }, Config::Docker(docker)) => {
                docker.host = host.trim().to_string();
            }
            (ConfigDraft::Kube { server, token, .. }, Config::Kube(kube)) => {
                let encoded = encrypt_if_present(vault, token)?;
                kube.server = server.trim().to_string();
                if let Some(encoded) = encoded {
                    kube.token = encoded;
                }
            }
            // Kinds were checked above
            _ => {}
        }

        Ok(())
    }
}

fn encrypt_if_present(vault: &CredentialVault, plain: &str) -> Result<Option<String>, ConfigError> {
    if plain.is_empty() {
        return Ok(None);
    }
    Ok(Some(vault.encrypt(plain)?))
}

/// Blank means the default port
fn parse_port(input: &str) -> Result<u16, ConfigError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(DEFAULT_SSH_PORT);
    }
    match input.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidPort(input.to_string())),
        Ok(port) => Ok(port),
    }
}
