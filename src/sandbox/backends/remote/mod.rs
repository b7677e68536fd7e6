//! Remote micro-VM sandbox.
//!
//! A sandbox is created through the lifecycle REST API, then driven through
//! the envd service running inside it: commands over the streaming process
//! RPC, files over the filesystem RPCs and the `/files` endpoint.

mod api;
mod envd;
pub mod envelope;
mod filesystem;
mod process;
mod readiness;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::{Result, RunboxError};
use crate::sandbox::traits::{Sandbox, SandboxFiles};
use crate::sandbox::types::{ExecResult, ExecSpec, FileEntry, FileSpec};
use crate::sandbox::{paths, shell};

pub use api::{LifecycleClient, SandboxHandle};
pub use envd::EnvdTransport;
pub use filesystem::FilesystemClient;
pub use process::{parse_stream, ProcessClient, StreamOutcome};
pub use readiness::{Probe, ReadinessProber};

/// A sandbox running in a remotely hosted micro-VM.
pub struct RemoteSandbox {
    handle: SandboxHandle,
    lifecycle: LifecycleClient,
    process: ProcessClient,
    files: RemoteFiles,
    work_dir: PathBuf,
    command_timeout: Duration,
    closed: Arc<AtomicBool>,
}

/// Builder for a freshly created [`RemoteSandbox`].
pub struct RemoteSandboxBuilder {
    config: RemoteConfig,
    template: Option<String>,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    files: Vec<FileSpec>,
}

impl RemoteSandboxBuilder {
    /// Template to create from, overriding `remote.template`.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Sandbox lifetime, overriding `remote.sandbox_timeout_seconds`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Environment variable set for the whole sandbox at creation.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// File written once the sandbox is ready.
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(FileSpec::new(path, content));
        self
    }

    pub async fn build(self) -> Result<RemoteSandbox> {
        let lifecycle = LifecycleClient::new(self.config.clone())?;
        let template = self
            .template
            .unwrap_or_else(|| self.config.template.clone());
        let timeout = self.timeout.unwrap_or_else(|| self.config.sandbox_timeout());

        let handle = lifecycle.create(&template, timeout, &self.env).await?;
        let sandbox = RemoteSandbox::attach(self.config, lifecycle, handle).await?;

        if !self.files.is_empty() {
            let setup = async { sandbox.files()?.setup(&self.files).await }.await;
            if let Err(e) = setup {
                if let Err(close_err) = sandbox.close().await {
                    warn!(error = %close_err, "Failed to destroy sandbox after setup error");
                }
                return Err(e);
            }
        }

        Ok(sandbox)
    }
}

impl RemoteSandbox {
    pub fn builder(config: RemoteConfig) -> RemoteSandboxBuilder {
        RemoteSandboxBuilder {
            config,
            template: None,
            timeout: None,
            env: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    /// Create a sandbox from the configured template and wait until it is ready.
    pub async fn new(config: RemoteConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Reattach to an existing sandbox by id.
    pub async fn connect(config: RemoteConfig, sandbox_id: &str) -> Result<Self> {
        let lifecycle = LifecycleClient::new(config.clone())?;
        let handle = lifecycle
            .reconnect(sandbox_id, config.sandbox_timeout())
            .await?;
        Self::attach(config, lifecycle, handle).await
    }

    async fn attach(
        config: RemoteConfig,
        lifecycle: LifecycleClient,
        handle: SandboxHandle,
    ) -> Result<Self> {
        let transport = EnvdTransport::new(
            handle.envd_url.clone(),
            handle.access_token.clone(),
            config.connect_timeout(),
        )?;

        let ready = ReadinessProber::new(
            &transport,
            config.ready_poll_interval(),
            config.ready_timeout(),
        )
        .wait()
        .await;
        if let Err(e) = ready {
            if let Err(destroy_err) = lifecycle.destroy(&handle.sandbox_id).await {
                warn!(
                    sandbox_id = %handle.sandbox_id,
                    error = %destroy_err,
                    "Failed to destroy sandbox that never became ready"
                );
            }
            return Err(e);
        }

        let work_dir = PathBuf::from(&config.work_dir);
        let closed = Arc::new(AtomicBool::new(false));
        let files = RemoteFiles {
            client: FilesystemClient::new(transport.clone()),
            work_dir: work_dir.clone(),
            closed: Arc::clone(&closed),
        };

        info!(
            sandbox_id = %handle.sandbox_id,
            envd_url = %handle.envd_url,
            "Remote sandbox attached"
        );

        Ok(Self {
            handle,
            lifecycle,
            process: ProcessClient::new(transport),
            files,
            work_dir,
            command_timeout: config.command_timeout(),
            closed,
        })
    }

    pub fn sandbox_id(&self) -> &str {
        &self.handle.sandbox_id
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Keep the sandbox alive for `timeout` from now.
    pub async fn extend_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        self.lifecycle
            .extend_timeout(&self.handle.sandbox_id, timeout)
            .await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunboxError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn execute(&self, spec: &ExecSpec) -> Result<ExecResult> {
        self.ensure_open()?;
        spec.validate()?;

        let script = shell::script_with_env(&spec.env, &spec.command);
        let cwd = match &spec.work_dir {
            Some(dir) => paths::resolve(&self.work_dir, &dir.to_string_lossy()),
            None => self.work_dir.clone(),
        };
        let timeout = spec.timeout.unwrap_or(self.command_timeout);

        debug!(sandbox_id = %self.handle.sandbox_id, "Executing command");
        self.process.run(&script, &cwd, timeout).await
    }

    fn files(&self) -> Result<&dyn SandboxFiles> {
        self.ensure_open()?;
        Ok(&self.files)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.lifecycle.destroy(&self.handle.sandbox_id).await?;
        info!(sandbox_id = %self.handle.sandbox_id, "Remote sandbox closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for RemoteSandbox {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(
                sandbox_id = %self.handle.sandbox_id,
                "Remote sandbox dropped without close(); it stays up until its timeout"
            );
        }
    }
}

/// File operations for a [`RemoteSandbox`].
struct RemoteFiles {
    client: FilesystemClient,
    work_dir: PathBuf,
    closed: Arc<AtomicBool>,
}

impl RemoteFiles {
    fn resolve(&self, path: &str) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunboxError::Closed);
        }
        Ok(paths::to_wire(&paths::resolve(&self.work_dir, path)))
    }
}

#[async_trait]
impl SandboxFiles for RemoteFiles {
    async fn create(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = paths::parent_dir(Path::new(&target)) {
            self.client.make_dir(&paths::to_wire(parent)).await?;
        }
        self.client.write(&target, content.as_bytes()).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        self.client.make_dir(&target).await
    }

    async fn read(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        self.client.read(&target).await
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(target) => self.client.exists(&target).await,
            Err(_) => false,
        }
    }

    async fn list_with_depth(&self, path: &str, max_depth: u32) -> Result<Vec<FileEntry>> {
        let target = self.resolve(path)?;
        let entries = self.client.list(&target, max_depth).await?;
        Ok(entries
            .into_iter()
            .map(|mut entry| {
                entry.path = paths::relative_to(&self.work_dir, Path::new(&entry.path));
                entry
            })
            .collect())
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;

        // The service always removes whole trees, so refuse non-empty
        // directories here when a plain delete was asked for.
        if !recursive {
            match self.client.list(&target, 1).await {
                Ok(entries) if !entries.is_empty() => {
                    return Err(RunboxError::RemoveFailed {
                        path: target,
                        status: None,
                        body: "directory not empty".to_string(),
                    });
                }
                Ok(_) | Err(RunboxError::NotADirectory { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.client.remove(&target).await
    }
}
