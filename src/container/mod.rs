//! Container exec backend (Docker Engine API via bollard)
//!
//! Flow: connect to the daemon named by a `DockerConfig`, list running
//! containers for the user to pick from, then create an interactive TTY
//! exec of `/bin/sh` in the chosen container and attach to it.

use std::io;

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::backend::{
    spawn_io_transport, BackendError, DuplexStream, Resizer, SessionBackend, TermSize,
};
use crate::config::DockerConfig;

/// Seconds before a daemon request gives up
const DAEMON_TIMEOUT_SECS: u64 = 30;

/// Shell started inside the container
const EXEC_SHELL: &str = "/bin/sh";

/// Summary of a running container, for a picker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub status: String,
}

impl ContainerInfo {
    /// First 12 characters of the id, as `docker ps` shows it
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }

    /// Primary name without the leading slash
    pub fn display_name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or_else(|| self.short_id())
    }
}

/// Connected container runtime
#[derive(Clone)]
pub struct DockerClient {
    name: String,
    docker: Docker,
}

impl DockerClient {
    /// Connect to the daemon in `config.host`, or the local default when empty.
    ///
    /// This only builds the client; an unreachable daemon surfaces on the
    /// first request.
    pub fn connect(config: &DockerConfig) -> Result<Self, BackendError> {
        let host = config.host.trim();
        let connected = if host.is_empty() {
            Docker::connect_with_local_defaults()
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, DAEMON_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            #[cfg(unix)]
            {
                Docker::connect_with_unix(host, DAEMON_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            #[cfg(windows)]
            {
                Docker::connect_with_named_pipe(host, DAEMON_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        };
        let docker = connected
            .map_err(|e| BackendError::InvalidTarget(format!("docker host '{}': {}", host, e)))?;

        debug!("Docker client created for {}", config.name);
        Ok(Self {
            name: config.name.clone(),
            docker,
        })
    }

    /// Running containers, in daemon order
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>, BackendError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        let containers: Vec<ContainerInfo> = summaries
            .into_iter()
            .filter_map(|c| {
                Some(ContainerInfo {
                    id: c.id?,
                    names: c.names.unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                })
            })
            .collect();

        debug!("{} running containers on {}", containers.len(), self.name);
        Ok(containers)
    }

    /// Backend that execs a shell in `container_id`
    pub fn exec_backend(&self, container_id: impl Into<String>) -> DockerExecBackend {
        DockerExecBackend {
            docker: self.docker.clone(),
            container_id: container_id.into(),
            size: TermSize::default(),
        }
    }
}

/// Interactive TTY exec in one container
pub struct DockerExecBackend {
    docker: Docker,
    container_id: String,
    size: TermSize,
}

impl DockerExecBackend {
    pub fn with_size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }
}

#[async_trait]
impl SessionBackend for DockerExecBackend {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn open(self: Box<Self>) -> Result<DuplexStream, BackendError> {
        // A container that vanished since listing fails here with NotFound
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(vec![EXEC_SHELL]),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(BackendError::Protocol("exec started detached".to_string()));
        };

        info!(
            "Attached to exec {} in container {}",
            exec.id, self.container_id
        );

        let mut resizer = ExecResizer {
            docker: self.docker.clone(),
            exec_id: exec.id.clone(),
        };
        // Initial geometry; the exec may not be running yet, so failures are only logged
        if let Err(e) = resizer.resize(self.size).await {
            debug!("Initial exec resize failed: {}", e);
        }

        let reader = StreamReader::new(output.map(|chunk| {
            chunk
                .map(|log| log.into_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }));

        Ok(spawn_io_transport(exec.id, reader, input, Some(resizer)))
    }
}

struct ExecResizer {
    docker: Docker,
    exec_id: String,
}

#[async_trait]
impl Resizer for ExecResizer {
    async fn resize(&mut self, size: TermSize) -> Result<(), BackendError> {
        self.docker
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await?;
        Ok(())
    }
}
