//! Backend open/stream error types

use thiserror::Error;

use crate::config::VaultError;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Dial(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Host key verification failed: {0}")]
    HostKey(String),

    /// Deliberately carries no detail about which credential was rejected
    #[error("Authentication failed")]
    Authentication,

    #[error("Session negotiation failed: {0}")]
    Session(String),

    #[error("PTY allocation failed: {0}")]
    Pty(String),

    #[error("Shell start failed: {0}")]
    Shell(String),

    #[error("No usable shell found")]
    NoShell,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Credential error: {0}")]
    Credential(#[from] VaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Open cancelled")]
    Cancelled,
}

impl BackendError {
    /// A normal open failure the user can retry or re-pick after
    /// (daemon down, target vanished, network unreachable)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::Dial(_)
                | BackendError::Timeout(_)
                | BackendError::Unavailable(_)
                | BackendError::NotFound(_)
        )
    }
}

impl From<russh::Error> for BackendError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => BackendError::Dial(e.to_string()),
            russh::Error::ConnectionTimeout | russh::Error::InactivityTimeout => {
                BackendError::Timeout(err.to_string())
            }
            other => BackendError::Protocol(other.to_string()),
        }
    }
}

impl From<bollard::errors::Error> for BackendError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as DockerError;
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => BackendError::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code: 409,
                message,
            } => BackendError::NotFound(format!("container not running: {}", message)),
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => BackendError::Protocol(format!("daemon returned {}: {}", status_code, message)),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

impl From<kube::Error> for BackendError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => BackendError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
                tracing::debug!("Cluster API rejected credentials: {}", resp.message);
                BackendError::Authentication
            }
            kube::Error::Api(resp) => {
                BackendError::Protocol(format!("API returned {}: {}", resp.code, resp.message))
            }
            kube::Error::HyperError(e) => BackendError::Dial(e.to_string()),
            kube::Error::Service(e) => BackendError::Unavailable(e.to_string()),
            other => BackendError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(BackendError::NotFound("c1".into()).is_recoverable());
        assert!(BackendError::Unavailable("daemon".into()).is_recoverable());
        assert!(!BackendError::Authentication.is_recoverable());
        assert!(!BackendError::Pty("denied".into()).is_recoverable());
    }

    #[test]
    fn test_authentication_message_is_generic() {
        assert_eq!(BackendError::Authentication.to_string(), "Authentication failed");
    }

    #[test]
    fn test_docker_status_mapping() {
        let err: BackendError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        }
        .into();
        assert!(matches!(err, BackendError::NotFound(_)));
        assert!(err.is_recoverable());

        let err: BackendError = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        }
        .into();
        assert!(matches!(err, BackendError::Protocol(_)));
    }
}
