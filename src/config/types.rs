//! Configuration Types
//!
//! Flat JSON records as persisted under the `sessions` and `commands`
//! preference keys. Secret fields hold vault-encoded strings, never plaintext.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::vault::{CredentialVault, VaultError};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn is_empty(s: &str) -> bool {
    s.is_empty()
}

/// A saved connection target
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Config {
    #[serde(rename = "ssh")]
    Ssh(SshConfig),
    #[serde(rename = "docker")]
    Docker(DockerConfig),
    #[serde(rename = "k8s")]
    Kube(KubeConfig),
}

/// Config discriminant, as written in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Ssh,
    Docker,
    Kube,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::Ssh => "ssh",
            ConfigKind::Docker => "docker",
            ConfigKind::Kube => "k8s",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Config {
    /// Display name, unique within a registry
    pub fn name(&self) -> &str {
        match self {
            Config::Ssh(c) => &c.name,
            Config::Docker(c) => &c.name,
            Config::Kube(c) => &c.name,
        }
    }

    pub fn kind(&self) -> ConfigKind {
        match self {
            Config::Ssh(_) => ConfigKind::Ssh,
            Config::Docker(_) => ConfigKind::Docker,
            Config::Kube(_) => ConfigKind::Kube,
        }
    }

    /// Whether this variant carries an encrypted secret field
    pub fn has_secret_field(&self) -> bool {
        !matches!(self, Config::Docker(_))
    }

    /// Raw encoded secret (empty when none or not applicable)
    pub fn encoded_secret(&self) -> &str {
        match self {
            Config::Ssh(c) => &c.password,
            Config::Kube(c) => &c.token,
            Config::Docker(_) => "",
        }
    }

    /// Encrypt and store the secret, returning the encoded value.
    ///
    /// Docker configs have no secret; the call is a no-op returning "".
    pub fn set_secret(
        &mut self,
        vault: &CredentialVault,
        plain: &str,
    ) -> Result<String, VaultError> {
        match self {
            Config::Ssh(c) => c.set_password(vault, plain),
            Config::Kube(c) => c.set_token(vault, plain),
            Config::Docker(_) => Ok(String::new()),
        }
    }

    /// Decrypt the stored secret
    pub fn secret(&self, vault: &CredentialVault) -> Result<String, VaultError> {
        vault.decrypt(self.encoded_secret())
    }
}

// Secrets stay out of debug output
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Config::Ssh(c) => f
                .debug_struct("Ssh")
                .field("name", &c.name)
                .field("host", &c.host)
                .field("port", &c.port)
                .field("user", &c.user)
                .field("password_len", &c.password.len())
                .finish(),
            Config::Docker(c) => f
                .debug_struct("Docker")
                .field("name", &c.name)
                .field("host", &c.host)
                .finish(),
            Config::Kube(c) => f
                .debug_struct("Kube")
                .field("name", &c.name)
                .field("server", &c.server)
                .field("token_len", &c.token.len())
                .finish(),
        }
    }
}

/// SSH host with password authentication
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port", deserialize_with = "port_or_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    /// Vault-encoded password
    #[serde(default, rename = "pswd", skip_serializing_if = "is_empty")]
    pub password: String,
}

impl SshConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            password: String::new(),
        }
    }

    pub fn set_password(
        &mut self,
        vault: &CredentialVault,
        plain: &str,
    ) -> Result<String, VaultError> {
        self.password = vault.encrypt(plain)?;
        Ok(self.password.clone())
    }

    pub fn password(&self, vault: &CredentialVault) -> Result<String, VaultError> {
        vault.decrypt(&self.password)
    }
}

// Records written with a zero or missing port fall back to the default.
fn port_or_default<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let port = Option::<u16>::deserialize(deserializer)?;
    Ok(match port {
        Some(0) | None => DEFAULT_SSH_PORT,
        Some(p) => p,
    })
}

/// Container runtime daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub name: String,
    /// Daemon address (`unix:///...`, `tcp://...`); empty means the local default
    #[serde(default, skip_serializing_if = "is_empty")]
    pub host: String,
}

impl DockerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }
}

/// Cluster API server with bearer-token authentication
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeConfig {
    pub name: String,
    #[serde(default)]
    pub server: String,
    /// Vault-encoded bearer token
    #[serde(default, skip_serializing_if = "is_empty")]
    pub token: String,
}

impl KubeConfig {
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            token: String::new(),
        }
    }

    pub fn set_token(&mut self, vault: &CredentialVault, plain: &str) -> Result<String, VaultError> {
        self.token = vault.encrypt(plain)?;
        Ok(self.token.clone())
    }

    pub fn token(&self, vault: &CredentialVault) -> Result<String, VaultError> {
        vault.decrypt(&self.token)
    }
}

/// A saved text snippet that can be sent to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    /// Records without a name are skipped on load
    #[serde(alias = "name")]
    pub name: String,
    #[serde(default, alias = "text")]
    pub text: String,
    #[serde(default, alias = "icon")]
    pub icon: String,
    #[serde(default, alias = "autoSubmit", alias = "autosubmit", alias = "auto_submit")]
    pub auto_submit: bool,
}

impl Command {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            icon: String::new(),
            auto_submit: false,
        }
    }

    pub fn with_auto_submit(mut self, auto_submit: bool) -> Self {
        self.auto_submit = auto_submit;
        self
    }

    /// Bytes to send: the text, followed by a carriage return when auto-submit is set
    pub fn payload(&self) -> String {
        if self.auto_submit {
            format!("{}\r", self.text)
        } else {
            self.text.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ssh_record_shape() {
        let mut cfg = SshConfig::new("box1", "10.0.0.5", "root");
        cfg.password = "ENC".to_string();
        let json = serde_json::to_value(Config::Ssh(cfg)).unwrap();

        assert_eq!(json["type"], "ssh");
        assert_eq!(json["name"], "box1");
        assert_eq!(json["host"], "10.0.0.5");
        assert_eq!(json["port"], 22);
        assert_eq!(json["user"], "root");
        assert_eq!(json["pswd"], "ENC");
    }

    #[test]
    fn test_parse_flat_records() {
        let ssh: Config =
            serde_json::from_str(r#"{"name":"a","type":"ssh","host":"h","user":"u","extra":1}"#)
                .unwrap();
        match &ssh {
            Config::Ssh(c) => {
                assert_eq!(c.port, DEFAULT_SSH_PORT);
                assert!(c.password.is_empty());
            }
            other => panic!("unexpected variant {:?}", other),
        }

        let docker: Config = serde_json::from_str(r#"{"name":"d","type":"docker"}"#).unwrap();
        assert_eq!(docker.kind(), ConfigKind::Docker);
        assert!(!docker.has_secret_field());

        let kube: Config =
            serde_json::from_str(r#"{"name":"k","type":"k8s","server":"https://api:6443"}"#)
                .unwrap();
        assert_eq!(kube.kind().as_str(), "k8s");

        let unknown = serde_json::from_str::<Config>(r#"{"name":"x","type":"telnet"}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_zero_port_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"name":"a","type":"ssh","host":"h","port":0}"#).unwrap();
        let Config::Ssh(ssh) = cfg else {
            panic!("expected ssh");
        };
        assert_eq!(ssh.port, 22);
    }

    #[test]
    fn test_secret_roundtrip_through_variant() {
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::new(dir.path().join("key"));

        let mut cfg = Config::Kube(KubeConfig::new("prod", "https://api:6443"));
        let encoded = cfg.set_secret(&vault, "bearer-token").unwrap();
        assert_ne!(encoded, "bearer-token");
        assert_eq!(cfg.encoded_secret(), encoded);
        assert_eq!(cfg.secret(&vault).unwrap(), "bearer-token");

        let mut docker = Config::Docker(DockerConfig::new("local", ""));
        assert_eq!(docker.set_secret(&vault, "ignored").unwrap(), "");
        assert_eq!(docker.secret(&vault).unwrap(), "");
    }

    #[test]
    fn test_debug_hides_secret() {
        let mut cfg = SshConfig::new("box1", "h", "u");
        cfg.password = "c2VjcmV0LWNpcGhlcnRleHQ=".to_string();
        let out = format!("{:?}", Config::Ssh(cfg));
        assert!(!out.contains("c2VjcmV0"));
        assert!(out.contains("password_len"));
    }

    #[test]
    fn test_command_json_and_payload() {
        let cmd = Command::new("ls", "ls -la").with_auto_submit(true);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["Name"], "ls");
        assert_eq!(json["Text"], "ls -la");
        assert_eq!(json["AutoSubmit"], true);
        assert_eq!(cmd.payload(), "ls -la\r");

        let plain: Command = serde_json::from_str(r#"{"Name":"p","Text":"pwd"}"#).unwrap();
        assert!(!plain.auto_submit);
        assert_eq!(plain.payload(), "pwd");
    }
}
