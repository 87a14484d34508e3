//! SSH backend using russh
//!
//! Open sequence: resolve, dial (with timeout), verify host key,
//! authenticate with the vault-held password, open a session channel,
//! allocate a PTY with echo disabled, start the shell. Any failure after the
//! handshake disconnects the handle before returning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::known_hosts::{HostKeyVerification, KnownHosts};
use crate::backend::{
    BackendError, DuplexStream, SessionBackend, StreamCommand, StreamError, TermSize,
    TransportEnd,
};
use crate::config::{CredentialVault, SshConfig};

/// Terminal modes sent with the PTY request: echo off, 14400 baud placeholders
const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// What to do with a server key that is not on record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Record unknown keys and continue; changed keys are rejected
    #[default]
    AcceptNew,
    /// Reject unknown and changed keys
    Strict,
}

/// Connection options shared by all SSH opens
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub timeout: Duration,
    pub term: String,
    pub size: TermSize,
    pub host_key_policy: HostKeyPolicy,
    /// Defaults to `~/.ssh/known_hosts`
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            term: "xterm-color".to_string(),
            size: TermSize::default(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
        }
    }
}

/// russh callback handler; verifies the server key against known_hosts
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<KnownHosts>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy, known_hosts: Option<KnownHosts>) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = BackendError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(known_hosts) = &self.known_hosts else {
            // No home directory to keep known_hosts in
            return match self.policy {
                HostKeyPolicy::AcceptNew => {
                    warn!("No known_hosts available, accepting key for {}:{}", self.host, self.port);
                    Ok(true)
                }
                HostKeyPolicy::Strict => Err(BackendError::HostKey(format!(
                    "no known_hosts file to verify {}:{}",
                    self.host, self.port
                ))),
            };
        };

        match known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => match self.policy {
                HostKeyPolicy::AcceptNew => {
                    info!(
                        "New host {}:{}, adding to known_hosts (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    if let Err(e) = known_hosts.add_host(&self.host, self.port, server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
                HostKeyPolicy::Strict => {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), rejecting",
                        self.host, self.port, fingerprint
                    );
                    Err(BackendError::HostKey(format!(
                        "unknown host {}:{} ({})",
                        self.host, self.port, fingerprint
                    )))
                }
            },
            HostKeyVerification::Revoked { fingerprint } => {
                error!(
                    "Revoked host key presented by {}:{} ({})",
                    self.host, self.port, fingerprint
                );
                Err(BackendError::HostKey(format!(
                    "key for {}:{} is revoked ({})",
                    self.host, self.port, fingerprint
                )))
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                error!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(BackendError::HostKey(format!(
                    "key for {}:{} has changed (expected {}, got {}); remove the old entry from known_hosts if this is legitimate",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

/// A resolved SSH target, ready to open
pub struct SshBackend {
    name: String,
    host: String,
    port: u16,
    user: String,
    password: Zeroizing<String>,
    options: SshOptions,
}

impl std::fmt::Debug for SshBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshBackend")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl SshBackend {
    /// Resolve the stored password through the vault
    pub fn from_config(
        config: &SshConfig,
        vault: &CredentialVault,
        options: SshOptions,
    ) -> Result<Self, BackendError> {
        if config.host.trim().is_empty() {
            return Err(BackendError::InvalidTarget(format!(
                "config '{}' has no host",
                config.name
            )));
        }

        Ok(Self {
            name: config.name.clone(),
            host: config.host.trim().to_string(),
            port: config.port,
            user: config.user.clone(),
            password: Zeroizing::new(config.password(vault)?),
            options,
        })
    }

    async fn dial(&self) -> Result<Handle<ClientHandler>, BackendError> {
        let timeout = self.options.timeout;

        let addr: SocketAddr = tokio::time::timeout(
            timeout,
            tokio::net::lookup_host((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| BackendError::Timeout(format!("resolving {}", self.host)))?
        .map_err(|e| BackendError::Dial(format!("failed to resolve {}: {}", self.host, e)))?
        .next()
        .ok_or_else(|| BackendError::Dial(format!("no address found for {}", self.host)))?;

        let known_hosts = match self
            .options
            .known_hosts_path
            .clone()
            .or_else(KnownHosts::default_path)
        {
            Some(path) => match KnownHosts::load(path) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!("Failed to load known_hosts: {}", e);
                    None
                }
            },
            None => None,
        };

        let handler = ClientHandler::new(
            self.host.clone(),
            self.port,
            self.options.host_key_policy,
            known_hosts,
        );

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        info!("Connecting to SSH server {} at {}", self.name, addr);

        let handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), addr, handler),
        )
        .await
        .map_err(|_| BackendError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|e| match e {
            BackendError::Protocol(msg) => BackendError::Session(msg),
            other => other,
        })?;

        debug!("SSH handshake completed with {}", addr);
        Ok(handle)
    }

    /// Everything after the handshake. The caller disconnects on error.
    async fn start_shell(
        &self,
        handle: &mut Handle<ClientHandler>,
    ) -> Result<Channel<Msg>, BackendError> {
        let auth = handle
            .authenticate_password(self.user.as_str(), self.password.as_str())
            .await?;
        if !auth.success() {
            // Which part of the credentials was wrong is not reported
            return Err(BackendError::Authentication);
        }
        info!("SSH authentication successful for {}", self.name);

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| BackendError::Session(e.to_string()))?;

        let size = self.options.size;
        channel
            .request_pty(
                true,
                &self.options.term,
                size.cols as u32,
                size.rows as u32,
                0,
                0,
                TERMINAL_MODES,
            )
            .await
            .map_err(|e| BackendError::Pty(e.to_string()))?;
        if !self.await_reply(&mut channel).await? {
            return Err(BackendError::Pty("server refused the PTY request".to_string()));
        }
        debug!("PTY allocated, requesting shell");

        channel
            .request_shell(true)
            .await
            .map_err(|e| BackendError::Shell(e.to_string()))?;
        if !self.await_reply(&mut channel).await? {
            return Err(BackendError::Shell("server refused the shell request".to_string()));
        }

        Ok(channel)
    }

    async fn await_reply(&self, channel: &mut Channel<Msg>) -> Result<bool, BackendError> {
        let wait = async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Success) => return true,
                    Some(ChannelMsg::Failure) | Some(ChannelMsg::Close) | None => return false,
                    Some(_) => continue,
                }
            }
        };
        tokio::time::timeout(self.options.timeout, wait)
            .await
            .map_err(|_| BackendError::Timeout("waiting for channel request reply".to_string()))
    }
}

#[async_trait]
impl SessionBackend for SshBackend {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn open(self: Box<Self>) -> Result<DuplexStream, BackendError> {
        let mut handle = self.dial().await?;

        let channel = match self.start_shell(&mut handle).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("SSH open failed for {}: {}", self.name, e);
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
                return Err(e);
            }
        };

        info!("Interactive shell started for {}", self.name);

        let (stream, transport) = crate::backend::channel(uuid::Uuid::new_v4().to_string(), true);
        tokio::spawn(run_channel_transport(transport, handle, channel));
        Ok(stream)
    }
}

/// Owns the SSH handle and shell channel until the stream closes
async fn run_channel_transport(
    transport: TransportEnd,
    handle: Handle<ClientHandler>,
    mut channel: Channel<Msg>,
) {
    let TransportEnd {
        id,
        mut commands,
        output,
    } = transport;

    debug!("SSH channel transport started for stream {}", id);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(StreamCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            error!("Failed to send data to SSH channel {}: {}", id, e);
                            let _ = output.send(Err(StreamError::Transport(e.to_string()))).await;
                            break;
                        }
                    }
                    Some(StreamCommand::Resize(size)) => {
                        debug!("Sending window_change {}x{} for {}", size.cols, size.rows, id);
                        if let Err(e) = channel
                            .window_change(size.cols as u32, size.rows as u32, 0, 0)
                            .await
                        {
                            warn!("Failed to resize PTY for {}: {}", id, e);
                        }
                    }
                    Some(StreamCommand::Close) | None => {
                        info!("Close requested for SSH stream {}", id);
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if output.send(Ok(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    // stderr
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        if output.send(Ok(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("SSH channel exit status {} for {}", exit_status, id);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        info!("SSH channel closed by server for {}", id);
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let _ = channel.close().await;
    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
    info!("SSH channel transport terminated for {}", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_options() {
        let options = SshOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.term, "xterm-color");
        assert_eq!(options.size, TermSize::new(80, 24));
        assert_eq!(options.host_key_policy, HostKeyPolicy::AcceptNew);
    }

    #[test]
    fn test_from_config_resolves_password() {
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::new(dir.path().join("key"));
        let mut cfg = SshConfig::new("box1", "10.0.0.5", "root");
        cfg.set_password(&vault, "s3cr3t").unwrap();

        let backend = SshBackend::from_config(&cfg, &vault, SshOptions::default()).unwrap();
        assert_eq!(backend.password.as_str(), "s3cr3t");
        assert!(!format!("{:?}", backend).contains("s3cr3t"));
    }

    #[test]
    fn test_from_config_rejects_undecryptable_password() {
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::new(dir.path().join("key"));
        let mut cfg = SshConfig::new("box1", "10.0.0.5", "root");
        cfg.password = "not base64!".to_string();

        let err = SshBackend::from_config(&cfg, &vault, SshOptions::default()).unwrap_err();
        assert!(matches!(err, BackendError::Credential(_)));
    }

    #[tokio::test]
    async fn test_dial_refused_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::new(dir.path().join("key"));

        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = SshConfig::new("closed", "127.0.0.1", "root");
        cfg.port = port;
        let options = SshOptions {
            timeout: Duration::from_secs(2),
            known_hosts_path: Some(dir.path().join("known_hosts")),
            ..Default::default()
        };

        let backend = SshBackend::from_config(&cfg, &vault, options).unwrap();
        let err = Box::new(backend).open().await.unwrap_err();
        assert!(err.is_recoverable(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    #[ignore = "requires a reachable SSH server (TERMHUB_TEST_SSH=host:port:user:password)"]
    async fn test_live_shell() {
        let spec = std::env::var("TERMHUB_TEST_SSH").unwrap();
        let parts: Vec<&str> = spec.splitn(4, ':').collect();
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::new(dir.path().join("key"));

        let mut cfg = SshConfig::new("live", parts[0], parts[2]);
        cfg.port = parts[1].parse().unwrap();
        cfg.set_password(&vault, parts[3]).unwrap();

        let backend = SshBackend::from_config(&cfg, &vault, SshOptions::default()).unwrap();
        let mut stream = Box::new(backend).open().await.unwrap();
        stream.write(b"echo termhub-ok\n".to_vec()).await.unwrap();

        let mut seen = String::new();
        while !seen.contains("termhub-ok") {
            let chunk = stream.read().await.unwrap().expect("stream ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        stream.close();
    }
}
