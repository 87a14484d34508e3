//! Session Registry
//!
//! Holds the saved Config and Command collections (persisted through a
//! `PreferenceStore` after every change) and the live terminal sessions,
//! keyed by session id. Sessions remove themselves when they close.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::terminal::{SessionInfo, TerminalSession, TerminalSink};
use super::SessionError;
use crate::backend::{open_in_background, SessionBackend};
use crate::cluster::KubeClient;
use crate::config::{
    load_commands, load_configs, save_commands, save_configs, Command, Config, ConfigDraft,
    ConfigError, CredentialVault, PreferenceStore,
};
use crate::container::DockerClient;
use crate::ssh::{SshBackend, SshOptions};

/// A session whose backend is still opening
pub struct PendingOpen {
    pub session: TerminalSession,
    done: oneshot::Receiver<Result<(), SessionError>>,
}

impl PendingOpen {
    /// Wait for the open to finish. On failure the session is already
    /// closed and its close listeners have been notified.
    pub async fn wait(self) -> Result<TerminalSession, SessionError> {
        match self.done.await {
            Ok(Ok(())) => Ok(self.session),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Closed),
        }
    }
}

pub struct SessionRegistry {
    vault: Arc<CredentialVault>,
    store: Arc<dyn PreferenceStore>,
    configs: RwLock<Vec<Arc<Config>>>,
    commands: RwLock<Vec<Command>>,
    sessions: Arc<DashMap<String, TerminalSession>>,
}

impl SessionRegistry {
    /// Empty registry; call `load()` to read the saved collections
    pub fn new(vault: Arc<CredentialVault>, store: Arc<dyn PreferenceStore>) -> Self {
        Self {
            vault,
            store,
            configs: RwLock::new(Vec::new()),
            commands: RwLock::new(Vec::new()),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// Replace both collections with what the store holds
    pub async fn load(&self) -> Result<(), SessionError> {
        let configs = load_configs(self.store.as_ref()).await?;
        let commands = load_commands(self.store.as_ref()).await?;
        info!(
            "Loaded {} configs and {} commands",
            configs.len(),
            commands.len()
        );

        *self.configs.write() = configs.into_iter().map(Arc::new).collect();
        *self.commands.write() = commands;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Configs
    // ═══════════════════════════════════════════════════════════════════════

    pub fn configs(&self) -> Vec<Arc<Config>> {
        self.configs.read().clone()
    }

    pub fn config(&self, name: &str) -> Option<Arc<Config>> {
        self.configs.read().iter().find(|c| c.name() == name).cloned()
    }

    /// Append a config. Names are unique.
    pub async fn add_config(&self, config: Config) -> Result<(), SessionError> {
        if config.name().trim().is_empty() {
            return Err(ConfigError::EmptyName.into());
        }
        {
            let mut configs = self.configs.write();
            if configs.iter().any(|c| c.name() == config.name()) {
                return Err(ConfigError::Duplicate(config.name().to_string()).into());
            }
            info!("Adding {} config '{}'", config.kind(), config.name());
            configs.push(Arc::new(config));
        }
        self.save_configs().await
    }

    /// Edit the config called `name` from form fields. Open sessions keep
    /// the config they were opened with.
    pub async fn update_config(&self, name: &str, draft: &ConfigDraft) -> Result<(), SessionError> {
        {
            let mut configs = self.configs.write();
            let slot = configs
                .iter_mut()
                .find(|c| c.name() == name)
                .ok_or_else(|| SessionError::ConfigNotFound(name.to_string()))?;

            let mut edited = Config::clone(slot);
            draft.apply_to(&mut edited, &self.vault)?;
            *slot = Arc::new(edited);
        }
        debug!("Updated config '{}'", name);
        self.save_configs().await
    }

    pub async fn remove_config(&self, name: &str) -> Result<Arc<Config>, SessionError> {
        let removed = {
            let mut configs = self.configs.write();
            let index = configs
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| SessionError::ConfigNotFound(name.to_string()))?;
            configs.remove(index)
        };
        info!("Removed config '{}'", name);
        self.save_configs().await?;
        Ok(removed)
    }

    async fn save_configs(&self) -> Result<(), SessionError> {
        let snapshot: Vec<Config> = self.configs.read().iter().map(|c| Config::clone(c)).collect();
        save_configs(self.store.as_ref(), &snapshot).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════════

    pub fn commands(&self) -> Vec<Command> {
        self.commands.read().clone()
    }

    pub async fn add_command(&self, command: Command) -> Result<(), SessionError> {
        if command.name.trim().is_empty() {
            return Err(ConfigError::EmptyName.into());
        }
        {
            let mut commands = self.commands.write();
            if commands.iter().any(|c| c.name == command.name) {
                return Err(ConfigError::Duplicate(command.name).into());
            }
            commands.push(command);
        }
        self.save_commands().await
    }

    pub async fn update_command(&self, index: usize, command: Command) -> Result<(), SessionError> {
        {
            let mut commands = self.commands.write();
            let slot = commands
                .get_mut(index)
                .ok_or(SessionError::CommandNotFound(index))?;
            *slot = command;
        }
        self.save_commands().await
    }

    pub async fn remove_command(&self, index: usize) -> Result<Command, SessionError> {
        let removed = {
            let mut commands = self.commands.write();
            if index >= commands.len() {
                return Err(SessionError::CommandNotFound(index));
            }
            commands.remove(index)
        };
        self.save_commands().await?;
        Ok(removed)
    }

    async fn save_commands(&self) -> Result<(), SessionError> {
        let snapshot = self.commands.read().clone();
        save_commands(self.store.as_ref(), &snapshot).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sessions
    // ═══════════════════════════════════════════════════════════════════════

    /// Track a new session and open `backend` for it in the background.
    /// Returns immediately; the session is in the Opening state.
    pub fn open(
        &self,
        backend: Box<dyn SessionBackend>,
        config: Option<Arc<Config>>,
        sink: Arc<dyn TerminalSink>,
    ) -> PendingOpen {
        let session = TerminalSession::new(config);
        let id = session.id().to_string();
        self.sessions.insert(id.clone(), session.clone());

        let sessions = Arc::clone(&self.sessions);
        let closing_id = id.clone();
        session.on_close(move |reason| {
            sessions.remove(&closing_id);
            debug!("Session {} untracked ({:?})", closing_id, reason);
        });

        info!("Opening {} session {} ({})", backend.kind(), id, session.name());
        let opened = open_in_background(backend);
        let (done_tx, done_rx) = oneshot::channel();
        let target = session.clone();
        tokio::spawn(async move {
            let result = match opened.await {
                Ok(Ok(stream)) => target.attach(stream, sink),
                Ok(Err(e)) => {
                    target.fail_open(&e);
                    Err(SessionError::Backend(e))
                }
                Err(_) => {
                    target.fail_open("open task ended without a result");
                    Err(SessionError::Closed)
                }
            };
            let _ = done_tx.send(result);
        });

        PendingOpen {
            session,
            done: done_rx,
        }
    }

    /// Open the user's shell on a local PTY
    #[cfg(feature = "local-terminal")]
    pub fn open_local(&self, sink: Arc<dyn TerminalSink>) -> PendingOpen {
        self.open(Box::new(crate::local::LocalBackend::new()), None, sink)
    }

    /// Open a saved SSH config. Container and cluster configs need a target
    /// picked through `docker_client` / `kube_client` and `open` instead.
    pub fn open_config(&self, name: &str, sink: Arc<dyn TerminalSink>) -> Result<PendingOpen, SessionError> {
        let config = self
            .config(name)
            .ok_or_else(|| SessionError::ConfigNotFound(name.to_string()))?;

        let backend = match config.as_ref() {
            Config::Ssh(ssh) => SshBackend::from_config(ssh, &self.vault, SshOptions::default())?,
            other => return Err(SessionError::SelectionRequired(other.kind())),
        };
        Ok(self.open(Box::new(backend), Some(config), sink))
    }

    /// Daemon client for a saved container config
    pub fn docker_client(&self, name: &str) -> Result<DockerClient, SessionError> {
        match self.config(name).as_deref() {
            Some(Config::Docker(docker)) => Ok(DockerClient::connect(docker)?),
            _ => Err(SessionError::ConfigNotFound(name.to_string())),
        }
    }

    /// API client for a saved cluster config
    pub fn kube_client(&self, name: &str) -> Result<KubeClient, SessionError> {
        match self.config(name).as_deref() {
            Some(Config::Kube(kube)) => Ok(KubeClient::connect(kube, &self.vault)?),
            _ => Err(SessionError::ConfigNotFound(name.to_string())),
        }
    }

    pub fn session(&self, session_id: &str) -> Option<TerminalSession> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.value().info()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Send a command's payload to a session
    pub async fn send_command(&self, session_id: &str, command: &Command) -> Result<(), SessionError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        debug!("Sending command '{}' to session {}", command.name, session_id);
        session.send(&command.payload()).await
    }

    /// Close every session (shutdown)
    pub fn close_all(&self) {
        let sessions: Vec<TerminalSession> = self.sessions.iter().map(|s| s.value().clone()).collect();
        if !sessions.is_empty() {
            warn!("Closing {} open sessions", sessions.len());
        }
        for session in sessions {
            session.close();
        }
    }
}
