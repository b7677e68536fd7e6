use tracing::debug;

use crate::config::types::{BackendType, SandboxConfig};
use crate::error::Result;
use crate::sandbox::backends::{DockerSandbox, LocalSandbox, RemoteSandbox};
use crate::sandbox::traits::Sandbox;

/// Create a sandbox based on the configuration.
///
/// The remote backend waits until the new sandbox is ready before returning.
pub async fn create_sandbox(config: &SandboxConfig) -> Result<Box<dyn Sandbox>> {
    debug!(backend = ?config.backend, "Creating sandbox");

    match config.backend {
        BackendType::Local => {
            let sandbox = LocalSandbox::new(&config.local)?;
            Ok(Box::new(sandbox))
        }

        BackendType::Docker => {
            let sandbox = DockerSandbox::new(&config.docker).await?;
            Ok(Box::new(sandbox))
        }

        BackendType::Remote => {
            let sandbox = RemoteSandbox::new(config.remote.clone()).await?;
            Ok(Box::new(sandbox))
        }
    }
}

/// Get information about available backends on this system.
pub async fn available_backends(config: &SandboxConfig) -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    backends.push(BackendInfo {
        name: "local",
        available: true,
        description: "Host processes in a working directory (no isolation)",
        unavailable_reason: None,
    });

    let docker = DockerSandbox::is_available().await;
    backends.push(BackendInfo {
        name: "docker",
        available: docker,
        description: "Docker container sandbox",
        unavailable_reason: if docker {
            None
        } else {
            Some("Docker daemon not accessible")
        },
    });

    let remote = config.remote.resolve_api_key().is_ok();
    backends.push(BackendInfo {
        name: "remote",
        available: remote,
        description: "Remote micro-VM sandbox over HTTP",
        unavailable_reason: if remote {
            None
        } else {
            Some("No API key configured (remote.api_key or RUNBOX_API_KEY)")
        },
    });

    backends
}

/// Information about a sandbox backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_is_always_available() {
        let backends = available_backends(&SandboxConfig::default()).await;
        let local = backends.iter().find(|b| b.name == "local").unwrap();
        assert!(local.available);
        assert_eq!(backends.len(), 3);
    }

    #[tokio::test]
    async fn test_default_config_creates_local_sandbox() {
        let sandbox = create_sandbox(&SandboxConfig::default()).await.unwrap();
        assert!(sandbox.as_ref().as_any().is::<LocalSandbox>());
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_without_key_fails_fast() {
        if std::env::var(crate::config::API_KEY_ENV).is_ok() {
            return;
        }
        let config = SandboxConfig {
            backend: BackendType::Remote,
            ..SandboxConfig::default()
        };
        assert!(matches!(
            create_sandbox(&config).await,
            Err(crate::error::RunboxError::Config(_))
        ));
    }
}
