//! Namespace → pod → container selection
//!
//! Picking a namespace clears the pod and container choices and starts a
//! background pod lookup; picking a pod clears the container choice and
//! starts a container lookup. Lookups report back through an update queue
//! that the owner drains with `next_update()` and feeds to `apply()`.
//! Results for a namespace or pod that is no longer selected are dropped.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ExecTarget, KubeClient, KubeExecBackend};
use crate::backend::BackendError;

/// Result of a background lookup
#[derive(Debug)]
pub enum SelectionUpdate {
    Pods {
        namespace: String,
        result: Result<Vec<String>, BackendError>,
    },
    Containers {
        namespace: String,
        pod: String,
        result: Result<Vec<String>, BackendError>,
    },
}

pub struct KubeSelector {
    client: KubeClient,
    namespaces: Vec<String>,
    pods: Vec<String>,
    containers: Vec<String>,
    namespace: Option<String>,
    pod: Option<String>,
    container: Option<String>,
    updates_tx: mpsc::UnboundedSender<SelectionUpdate>,
    updates_rx: mpsc::UnboundedReceiver<SelectionUpdate>,
}

impl KubeSelector {
    /// Fetch the namespace list and start with nothing selected
    pub async fn load(client: KubeClient) -> Result<Self, BackendError> {
        let namespaces = client.namespaces().await?;
        debug!("{} namespaces on {}", namespaces.len(), client.name());
        Ok(Self::with_namespaces(client, namespaces))
    }

    pub fn with_namespaces(client: KubeClient, namespaces: Vec<String>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            client,
            namespaces,
            pods: Vec::new(),
            containers: Vec::new(),
            namespace: None,
            pod: None,
            container: None,
            updates_tx,
            updates_rx,
        }
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn pods(&self) -> &[String] {
        &self.pods
    }

    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    pub fn selected_namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn selected_pod(&self) -> Option<&str> {
        self.pod.as_deref()
    }

    pub fn selected_container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn select_namespace(&mut self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        self.namespace = Some(namespace.clone());
        self.pods.clear();
        self.pod = None;
        self.containers.clear();
        self.container = None;

        let client = self.client.clone();
        let tx = self.updates_tx.clone();
        tokio::spawn(async move {
            let result = client.pods(&namespace).await;
            let _ = tx.send(SelectionUpdate::Pods { namespace, result });
        });
    }

    /// Ignored while no namespace is selected
    pub fn select_pod(&mut self, pod: impl Into<String>) {
        let Some(namespace) = self.namespace.clone() else {
            warn!("Pod selected before a namespace");
            return;
        };
        let pod = pod.into();
        self.pod = Some(pod.clone());
        self.containers.clear();
        self.container = None;

        let client = self.client.clone();
        let tx = self.updates_tx.clone();
        tokio::spawn(async move {
            let result = client.containers(&namespace, &pod).await;
            let _ = tx.send(SelectionUpdate::Containers {
                namespace,
                pod,
                result,
            });
        });
    }

    pub fn select_container(&mut self, container: impl Into<String>) {
        self.container = Some(container.into());
    }

    /// Next finished lookup. Never `None` while the selector is alive.
    pub async fn next_update(&mut self) -> Option<SelectionUpdate> {
        self.updates_rx.recv().await
    }

    /// Apply a lookup result.
    ///
    /// Returns `Ok(false)` for a stale result, `Ok(true)` when the options
    /// were replaced, and the lookup's error when a current lookup failed.
    pub fn apply(&mut self, update: SelectionUpdate) -> Result<bool, BackendError> {
        match update {
            SelectionUpdate::Pods { namespace, result } => {
                if self.namespace.as_deref() != Some(namespace.as_str()) {
                    debug!("Dropping stale pod list for {}", namespace);
                    return Ok(false);
                }
                self.pods = result?;
                Ok(true)
            }
            SelectionUpdate::Containers {
                namespace,
                pod,
                result,
            } => {
                if self.namespace.as_deref() != Some(namespace.as_str())
                    || self.pod.as_deref() != Some(pod.as_str())
                {
                    debug!("Dropping stale container list for {}/{}", namespace, pod);
                    return Ok(false);
                }
                self.containers = result?;
                Ok(true)
            }
        }
    }

    /// The full selection, if all three levels are chosen
    pub fn target(&self) -> Option<ExecTarget> {
        Some(ExecTarget {
            namespace: self.namespace.clone()?,
            pod: self.pod.clone()?,
            container: self.container.clone()?,
        })
    }

    pub fn exec_backend(&self) -> Option<KubeExecBackend> {
        self.target().map(|target| self.client.exec_backend(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialVault, KubeConfig};
    use tempfile::tempdir;

    fn selector(dir: &tempfile::TempDir) -> KubeSelector {
        let vault = CredentialVault::new(dir.path().join("key"));
        // Nothing listens here; background lookups fail and are not awaited
        let client = KubeClient::connect(&KubeConfig::new("c", "https://127.0.0.1:9"), &vault).unwrap();
        KubeSelector::with_namespaces(client, vec!["default".into(), "kube-system".into()])
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_namespace_change_drops_stale_pods() {
        let dir = tempdir().unwrap();
        let mut sel = selector(&dir);

        sel.select_namespace("default");
        sel.select_namespace("kube-system");

        let stale = SelectionUpdate::Pods {
            namespace: "default".into(),
            result: Ok(names(&["web-1"])),
        };
        assert!(!sel.apply(stale).unwrap());
        assert!(sel.pods().is_empty());

        let fresh = SelectionUpdate::Pods {
            namespace: "kube-system".into(),
            result: Ok(names(&["coredns-1", "coredns-2"])),
        };
        assert!(sel.apply(fresh).unwrap());
        assert_eq!(sel.pods(), names(&["coredns-1", "coredns-2"]).as_slice());
    }

    #[tokio::test]
    async fn test_selection_invalidates_downstream() {
        let dir = tempdir().unwrap();
        let mut sel = selector(&dir);

        sel.select_namespace("default");
        sel.apply(SelectionUpdate::Pods {
            namespace: "default".into(),
            result: Ok(names(&["web-1", "web-2"])),
        })
        .unwrap();
        sel.select_pod("web-1");
        sel.apply(SelectionUpdate::Containers {
            namespace: "default".into(),
            pod: "web-1".into(),
            result: Ok(names(&["app", "sidecar"])),
        })
        .unwrap();
        sel.select_container("app");
        assert_eq!(
            sel.target(),
            Some(ExecTarget {
                namespace: "default".into(),
                pod: "web-1".into(),
                container: "app".into(),
            })
        );

        sel.select_pod("web-2");
        assert!(sel.containers().is_empty());
        assert_eq!(sel.selected_container(), None);
        assert!(sel.target().is_none());

        // Containers for the previous pod arrive late
        let late = SelectionUpdate::Containers {
            namespace: "default".into(),
            pod: "web-1".into(),
            result: Ok(names(&["app"])),
        };
        assert!(!sel.apply(late).unwrap());

        sel.select_namespace("kube-system");
        assert!(sel.pods().is_empty());
        assert_eq!(sel.selected_pod(), None);
    }

    #[tokio::test]
    async fn test_current_lookup_error_is_reported() {
        let dir = tempdir().unwrap();
        let mut sel = selector(&dir);

        sel.select_namespace("default");
        let failed = SelectionUpdate::Pods {
            namespace: "default".into(),
            result: Err(BackendError::Authentication),
        };
        assert!(matches!(sel.apply(failed), Err(BackendError::Authentication)));
    }

    #[tokio::test]
    async fn test_pod_without_namespace_is_ignored() {
        let dir = tempdir().unwrap();
        let mut sel = selector(&dir);

        sel.select_pod("web-1");
        assert_eq!(sel.selected_pod(), None);
    }

    #[tokio::test]
    async fn test_background_lookup_posts_update() {
        let dir = tempdir().unwrap();
        let mut sel = selector(&dir);

        sel.select_namespace("default");
        let update = sel.next_update().await.unwrap();
        assert!(matches!(
            &update,
            SelectionUpdate::Pods { namespace, result: Err(_) } if namespace == "default"
        ));
        assert!(sel.apply(update).is_err());
    }
}
