//! Cluster remote-exec backend (Kubernetes API via kube)
//!
//! Flow: namespaces, then pods in the chosen namespace, then containers in
//! the chosen pod (see `selector`), then an interactive TTY exec over the
//! API server's websocket exec endpoint.

pub mod resize;
pub mod selector;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use secrecy::SecretString;
use tracing::{debug, info};

use crate::backend::{spawn_io_transport, BackendError, DuplexStream, SessionBackend, TermSize};
use crate::config::{CredentialVault, KubeConfig};

use resize::{resize_queue, spawn_resize_forwarder, QueueResizer};

pub use resize::{ResizeHandle, ResizeQueue};
pub use selector::{KubeSelector, SelectionUpdate};

/// Pods and containers offered for selection are capped at this many
pub const SELECTION_LIMIT: usize = 20;

/// Prefer bash, fall back to sh
const EXEC_COMMAND: [&str; 3] = ["sh", "-c", "exec $(command -v bash || command -v sh)"];

/// Container to exec into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

/// Authenticated API client for one cluster
#[derive(Clone)]
pub struct KubeClient {
    name: String,
    client: Client,
}

impl KubeClient {
    /// Build a client for `config.server` with the vault-decrypted bearer
    /// token. Server certificates are not verified.
    ///
    /// Must be called inside a tokio runtime. No request is made here.
    pub fn connect(config: &KubeConfig, vault: &CredentialVault) -> Result<Self, BackendError> {
        let server = config.server.trim();
        let uri = server
            .parse::<http::Uri>()
            .map_err(|e| BackendError::InvalidTarget(format!("server '{}': {}", server, e)))?;
        if uri.host().is_none() {
            return Err(BackendError::InvalidTarget(format!(
                "server '{}' has no host",
                server
            )));
        }

        let mut kube_config = kube::Config::new(uri);
        kube_config.accept_invalid_certs = true;

        let token = config.token(vault)?;
        if !token.is_empty() {
            kube_config.auth_info.token = Some(SecretString::from(token));
        }

        let client = Client::try_from(kube_config)
            .map_err(|e| BackendError::InvalidTarget(format!("server '{}': {}", server, e)))?;

        debug!("Cluster client created for {}", config.name);
        Ok(Self {
            name: config.name.clone(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All namespace names
    pub async fn namespaces(&self) -> Result<Vec<String>, BackendError> {
        let list = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    /// Pod names in `namespace`, at most `SELECTION_LIMIT`
    pub async fn pods(&self, namespace: &str) -> Result<Vec<String>, BackendError> {
        let list = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default().limit(SELECTION_LIMIT as u32))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .take(SELECTION_LIMIT)
            .collect())
    }

    /// Container names from the pod spec, at most `SELECTION_LIMIT`
    pub async fn containers(&self, namespace: &str, pod: &str) -> Result<Vec<String>, BackendError> {
        let pod = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get(pod)
            .await?;
        Ok(pod
            .spec
            .map(|spec| spec.containers)
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.name)
            .take(SELECTION_LIMIT)
            .collect())
    }

    pub fn exec_backend(&self, target: ExecTarget) -> KubeExecBackend {
        KubeExecBackend {
            client: self.client.clone(),
            target,
            size: TermSize::default(),
        }
    }
}

/// Interactive TTY exec in one pod container
pub struct KubeExecBackend {
    client: Client,
    target: ExecTarget,
    size: TermSize,
}

impl KubeExecBackend {
    pub fn with_size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }
}

#[async_trait]
impl SessionBackend for KubeExecBackend {
    fn kind(&self) -> &'static str {
        "k8s"
    }

    async fn open(self: Box<Self>) -> Result<DuplexStream, BackendError> {
        let ExecTarget {
            namespace,
            pod,
            container,
        } = self.target;

        let params = AttachParams::interactive_tty().container(container.clone());
        let mut attached = Api::<Pod>::namespaced(self.client, &namespace)
            .exec(&pod, EXEC_COMMAND, &params)
            .await?;

        // Dropping `attached` on an early return ends the exec
        let (Some(stdin), Some(stdout)) = (attached.stdin(), attached.stdout()) else {
            return Err(BackendError::Protocol("exec did not attach stdio".to_string()));
        };
        let Some(size_sink) = attached.terminal_size() else {
            return Err(BackendError::Protocol("exec has no terminal size channel".to_string()));
        };

        let (handle, queue) = resize_queue();
        handle.push(self.size);
        spawn_resize_forwarder(queue, size_sink);

        let id = format!("{}/{}/{}", namespace, pod, container);
        info!("Attached to exec in {}", id);

        Ok(spawn_io_transport(
            id,
            stdout,
            stdin,
            Some(QueueResizer::new(handle)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vault() -> (tempfile::TempDir, CredentialVault) {
        let dir = tempdir().unwrap();
        let vault = CredentialVault::new(dir.path().join("key"));
        (dir, vault)
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_server() {
        let (_dir, vault) = vault();
        for server in ["", "not a url", "/just/a/path"] {
            let cfg = KubeConfig::new("c", server);
            let err = KubeClient::connect(&cfg, &vault).err().unwrap();
            assert!(
                matches!(err, BackendError::InvalidTarget(_)),
                "server {:?}: {:?}",
                server,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_connect_with_token() {
        let (_dir, vault) = vault();
        let mut cfg = KubeConfig::new("prod", "https://10.0.0.1:6443");
        cfg.set_token(&vault, "eyJhbGciOi.token").unwrap();

        let client = KubeClient::connect(&cfg, &vault).unwrap();
        assert_eq!(client.name(), "prod");
    }

    #[tokio::test]
    async fn test_undecryptable_token_is_credential_error() {
        let (_dir, vault) = vault();
        let mut cfg = KubeConfig::new("prod", "https://10.0.0.1:6443");
        cfg.token = "bm90IGEgcmVhbCBwYXlsb2Fk".to_string();

        let err = KubeClient::connect(&cfg, &vault).err().unwrap();
        assert!(matches!(err, BackendError::Credential(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_recoverable() {
        let (_dir, vault) = vault();
        let client = KubeClient::connect(&KubeConfig::new("c", "https://127.0.0.1:9"), &vault).unwrap();
        let err = client.namespaces().await.unwrap_err();
        assert!(err.is_recoverable(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    #[ignore = "requires a reachable cluster in TERMHUB_TEST_K8S_SERVER/TERMHUB_TEST_K8S_TOKEN"]
    async fn test_live_exec() {
        let (_dir, vault) = vault();
        let mut cfg = KubeConfig::new("live", std::env::var("TERMHUB_TEST_K8S_SERVER").unwrap());
        cfg.set_token(&vault, &std::env::var("TERMHUB_TEST_K8S_TOKEN").unwrap())
            .unwrap();
        let client = KubeClient::connect(&cfg, &vault).unwrap();

        let namespace = client.namespaces().await.unwrap().remove(0);
        let pod = client.pods(&namespace).await.unwrap().remove(0);
        let container = client.containers(&namespace, &pod).await.unwrap().remove(0);

        let mut stream = Box::new(client.exec_backend(ExecTarget {
            namespace,
            pod,
            container,
        }))
        .open()
        .await
        .unwrap();
        stream.write(b"echo termhub-ok\n".to_vec()).await.unwrap();

        let mut seen = String::new();
        while !seen.contains("termhub-ok") {
            let chunk = stream.read().await.unwrap().expect("stream ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        stream.close();
    }
}
