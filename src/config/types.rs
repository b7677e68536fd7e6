use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, RunboxError};

/// Environment variable consulted when `remote.api_key` is not configured.
pub const API_KEY_ENV: &str = "RUNBOX_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunboxConfig {
    pub sandbox: SandboxConfig,
}

/// The type of sandbox backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Host processes in a working directory (no isolation)
    #[default]
    Local,
    /// A long-lived Docker container
    Docker,
    /// A remotely hosted micro-VM reached over HTTP
    Remote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Local backend configuration
    pub local: LocalConfig,
    /// Docker-specific configuration
    pub docker: DockerConfig,
    /// Remote micro-VM configuration
    pub remote: RemoteConfig,
}

/// Local backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Working directory; a fresh temporary directory is used when unset
    pub work_dir: Option<PathBuf>,
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image the session container runs
    pub image: String,
    /// Enable networking in the container (default: false)
    pub enable_networking: bool,
    /// Memory limit in MB
    pub memory_limit_mb: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/spring-ai-community/agents-runtime:latest".to_string(),
            enable_networking: false,
            memory_limit_mb: 512,
        }
    }
}

/// Remote micro-VM configuration.
///
/// Durations are stored as plain integers so the struct maps one-to-one onto
/// the TOML file; use the accessor methods to get `Duration`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Credential for the lifecycle API (falls back to `RUNBOX_API_KEY`)
    pub api_key: Option<String>,
    /// Base URL of the lifecycle API
    pub api_url: String,
    /// Routing domain used when the create response carries none
    pub domain: String,
    /// Template new sandboxes are created from
    pub template: String,
    /// Lifetime of a created sandbox, in seconds
    pub sandbox_timeout_seconds: u64,
    /// Default per-command timeout, in seconds
    pub command_timeout_seconds: u64,
    /// Working root inside the sandbox
    pub work_dir: String,
    /// Fixed envd base URL, bypassing the `{port}-{id}.{domain}` scheme
    pub envd_url: Option<String>,
    /// Port the envd service listens on inside the sandbox
    pub envd_port: u16,
    /// Overall readiness deadline, in milliseconds
    pub ready_timeout_ms: u64,
    /// Interval between health probes, in milliseconds
    pub ready_poll_interval_ms: u64,
    /// TCP connect timeout for every HTTP call, in seconds
    pub connect_timeout_seconds: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://api.e2b.dev".to_string(),
            domain: "e2b.dev".to_string(),
            template: "base".to_string(),
            sandbox_timeout_seconds: 300,
            command_timeout_seconds: 120,
            work_dir: "/home/user".to_string(),
            envd_url: None,
            envd_port: 49983,
            ready_timeout_ms: 60_000,
            ready_poll_interval_ms: 500,
            connect_timeout_seconds: 30,
        }
    }
}

impl RemoteConfig {
    /// Resolve the API key from the config or the environment.
    pub fn resolve_api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                std::env::var(API_KEY_ENV)
                    .ok()
                    .filter(|key| !key.trim().is_empty())
            })
            .ok_or_else(|| {
                RunboxError::Config(format!(
                    "remote API key is required (set remote.api_key or {})",
                    API_KEY_ENV
                ))
            })
    }

    /// Base URL of the envd service for a sandbox.
    pub fn envd_url_for(&self, sandbox_id: &str, domain: Option<&str>) -> String {
        if let Some(url) = &self.envd_url {
            return url.trim_end_matches('/').to_string();
        }
        let domain = domain
            .filter(|d| !d.is_empty())
            .unwrap_or(self.domain.as_str());
        format!("https://{}-{}.{}", self.envd_port, sandbox_id, domain)
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}
