use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RemoteConfig;
use crate::error::{Result, RunboxError};

const API_KEY_HEADER: &str = "X-API-Key";

/// Budget for create/connect, which may wait on a VM being scheduled.
const PROVISION_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for the remaining lifecycle calls.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of a remote sandbox, as returned by create or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub template_id: Option<String>,
    /// Routing domain, falling back to the configured default
    pub domain: String,
    /// Credential for the envd service; unsecured sandboxes have none
    pub access_token: Option<String>,
    pub envd_version: Option<String>,
    /// Lifetime requested for the sandbox
    pub timeout: Duration,
    /// Base URL of the envd service inside the sandbox
    pub envd_url: String,
}

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
    #[serde(rename = "envVars")]
    env_vars: &'a BTreeMap<String, String>,
    secure: bool,
}

#[derive(Debug, Serialize)]
struct TimeoutRequest {
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "templateID")]
    template_id: Option<String>,
    domain: Option<String>,
    #[serde(rename = "envdAccessToken")]
    envd_access_token: Option<String>,
    #[serde(rename = "envdVersion")]
    envd_version: Option<String>,
}

/// Client for the sandbox lifecycle REST API.
///
/// Creates, reconnects to, extends and destroys remote sandboxes. Every call
/// carries the API key and is bounded by its own request timeout, separate
/// from command execution timeouts.
pub struct LifecycleClient {
    config: RemoteConfig,
    api_key: String,
    client: reqwest::Client,
}

impl LifecycleClient {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// Create a sandbox from `template`.
    pub async fn create(
        &self,
        template: &str,
        timeout: Duration,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<SandboxHandle> {
        let request = CreateSandboxRequest {
            template_id: template,
            timeout: timeout.as_secs(),
            env_vars,
            secure: true,
        };

        debug!(template = %template, "Creating sandbox");

        let response = self
            .client
            .post(self.url("/sandboxes"))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .timeout(PROVISION_TIMEOUT)
            .send()
            .await
            .map_err(|e| RunboxError::CreationFailed {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RunboxError::CreationFailed {
                status: Some(status.as_u16()),
                body: body_text(response).await,
            });
        }

        let body = body_text(response).await;
        let parsed: SandboxResponse =
            serde_json::from_str(&body).map_err(|e| RunboxError::CreationFailed {
                status: Some(status.as_u16()),
                body: format!("unparseable response ({}): {}", e, body),
            })?;

        let handle = self.handle_from(parsed, timeout);
        info!(sandbox_id = %handle.sandbox_id, template = %template, "Created sandbox");
        Ok(handle)
    }

    /// Resume a previously created sandbox.
    pub async fn reconnect(&self, sandbox_id: &str, timeout: Duration) -> Result<SandboxHandle> {
        debug!(sandbox_id = %sandbox_id, "Reconnecting to sandbox");

        let reconnect_failed = |status: Option<u16>, body: String| RunboxError::ReconnectFailed {
            id: sandbox_id.to_string(),
            status,
            body,
        };

        let response = self
            .client
            .post(self.url(&format!("/sandboxes/{}/connect", sandbox_id)))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&TimeoutRequest {
                timeout: timeout.as_secs(),
            })
            .timeout(PROVISION_TIMEOUT)
            .send()
            .await
            .map_err(|e| reconnect_failed(None, e.to_string()))?;

        let status = response.status();
        let body = body_text(response).await;
        if !status.is_success() {
            return Err(reconnect_failed(Some(status.as_u16()), body));
        }

        let parsed: SandboxResponse = serde_json::from_str(&body).map_err(|e| {
            reconnect_failed(
                Some(status.as_u16()),
                format!("unparseable response ({}): {}", e, body),
            )
        })?;

        let handle = self.handle_from(parsed, timeout);
        info!(sandbox_id = %handle.sandbox_id, "Reconnected to sandbox");
        Ok(handle)
    }

    /// Destroy a sandbox. A sandbox that is already gone counts as destroyed.
    pub async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        debug!(sandbox_id = %sandbox_id, "Destroying sandbox");

        let response = self
            .client
            .delete(self.url(&format!("/sandboxes/{}", sandbox_id)))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| RunboxError::DestroyFailed {
                id: sandbox_id.to_string(),
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(sandbox_id = %sandbox_id, "Sandbox already destroyed");
            return Ok(());
        }
        if !status.is_success() {
            return Err(RunboxError::DestroyFailed {
                id: sandbox_id.to_string(),
                status: Some(status.as_u16()),
                body: body_text(response).await,
            });
        }

        info!(sandbox_id = %sandbox_id, "Destroyed sandbox");
        Ok(())
    }

    /// Push the sandbox's expiry out to `timeout` from now.
    pub async fn extend_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/sandboxes/{}/timeout", sandbox_id)))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&TimeoutRequest {
                timeout: timeout.as_secs(),
            })
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| RunboxError::ExtendTimeoutFailed {
                id: sandbox_id.to_string(),
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RunboxError::ExtendTimeoutFailed {
                id: sandbox_id.to_string(),
                status: Some(status.as_u16()),
                body: body_text(response).await,
            });
        }

        debug!(sandbox_id = %sandbox_id, timeout_secs = timeout.as_secs(), "Extended sandbox timeout");
        Ok(())
    }

    fn handle_from(&self, response: SandboxResponse, timeout: Duration) -> SandboxHandle {
        let domain = response
            .domain
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| self.config.domain.clone());
        let envd_url = self
            .config
            .envd_url_for(&response.sandbox_id, Some(domain.as_str()));

        SandboxHandle {
            sandbox_id: response.sandbox_id,
            template_id: response.template_id,
            domain,
            access_token: response.envd_access_token.filter(|t| !t.is_empty()),
            envd_version: response.envd_version,
            timeout,
            envd_url,
        }
    }
}

/// Response body as text, for error reports.
pub(crate) async fn body_text(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {}>", e))
}
