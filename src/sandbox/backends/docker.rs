use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DockerConfig;
use crate::error::{Result, RunboxError};
use crate::sandbox::paths;
use crate::sandbox::shell;
use crate::sandbox::traits::{Sandbox, SandboxFiles};
use crate::sandbox::types::{ExecResult, ExecSpec, FileEntry, FileType};

/// Working directory inside the container
const WORK_DIR: &str = "/work";

/// Timeout applied when an `ExecSpec` carries none.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit codes the file scripts use to report a missing path / a non-directory.
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_NOT_A_DIRECTORY: i32 = 4;

/// Docker sandbox backend.
///
/// Runs one long-lived container per sandbox and executes every command in
/// it with `docker exec`, so files written by one call are visible to the next.
pub struct DockerSandbox {
    image: String,
    work_dir: PathBuf,
    files: DockerFiles,
    closed: Arc<AtomicBool>,
}

impl DockerSandbox {
    /// Start a container from `config.image`.
    pub async fn new(config: &DockerConfig) -> Result<Self> {
        if !Self::is_available().await {
            return Err(RunboxError::BackendNotAvailable {
                backend: "docker".to_string(),
                reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                    .to_string(),
            });
        }

        info!(image = %config.image, "Starting Docker sandbox container...");

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d"]);

        // Network isolation
        if !config.enable_networking {
            cmd.arg("--network=none");
        }

        cmd.arg(format!("--memory={}m", config.memory_limit_mb));
        cmd.args(["-w", WORK_DIR]);

        // Image and command to keep the container running
        cmd.arg(&config.image);
        cmd.args(["sleep", "infinity"]);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| RunboxError::CreationFailed {
            status: None,
            body: format!("failed to run docker: {}", e),
        })?;

        if !output.status.success() {
            return Err(RunboxError::CreationFailed {
                status: None,
                body: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(container_id = %container_id, "Docker sandbox container started");

        let closed = Arc::new(AtomicBool::new(false));
        Ok(Self {
            image: config.image.clone(),
            work_dir: PathBuf::from(WORK_DIR),
            files: DockerFiles {
                container: Container { id: container_id },
                work_dir: PathBuf::from(WORK_DIR),
                closed: Arc::clone(&closed),
            },
            closed,
        })
    }

    /// Check if the Docker daemon is reachable.
    pub async fn is_available() -> bool {
        match Command::new("docker")
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.files.container.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunboxError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn execute(&self, spec: &ExecSpec) -> Result<ExecResult> {
        self.ensure_open()?;
        spec.validate()?;

        let cwd = match &spec.work_dir {
            Some(dir) => paths::resolve(&self.work_dir, &dir.to_string_lossy()),
            None => self.work_dir.clone(),
        };
        let timeout = spec.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let mut args: Vec<String> = vec!["-w".to_string(), paths::to_wire(&cwd)];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.container_id().to_string());
        args.push("bash".to_string());
        args.push("-lc".to_string());
        args.push(shell::command_text(&spec.command));

        self.files.container.exec(&args, timeout).await
    }

    fn files(&self) -> Result<&dyn SandboxFiles> {
        self.ensure_open()?;
        Ok(&self.files)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let container_id = self.container_id();
        info!(container_id = %container_id, "Removing Docker sandbox container...");

        let output = Command::new("docker")
            .args(["rm", "-f", container_id])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container_id = %container_id, error = %stderr, "Failed to remove container");
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Container {
    id: String,
}

impl Container {
    /// Run `docker exec <args>` to completion.
    async fn exec(&self, args: &[String], timeout: Duration) -> Result<ExecResult> {
        debug!(container_id = %self.id, "Executing via docker exec");

        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| RunboxError::ExecutionFailed {
            status: None,
            body: format!("failed to execute docker exec: {}", e),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(container_id = %self.id, timeout_ms = timeout.as_millis() as u64, "docker exec timed out");
                return Err(RunboxError::Timeout { timeout });
            }
        };

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };

        debug!(
            exit_code = result.exit_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Command completed"
        );
        Ok(result)
    }

    /// Run a bash script with positional arguments (`$1`, `$2`, ...).
    async fn script(&self, script: &str, params: &[&str]) -> Result<ExecResult> {
        let mut args = vec![
            self.id.clone(),
            "bash".to_string(),
            "-c".to_string(),
            script.to_string(),
            "runbox".to_string(),
        ];
        args.extend(params.iter().map(|p| p.to_string()));
        self.exec(&args, DEFAULT_COMMAND_TIMEOUT).await
    }
}

struct DockerFiles {
    container: Container,
    work_dir: PathBuf,
    closed: Arc<AtomicBool>,
}

impl DockerFiles {
    fn resolve(&self, path: &str) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunboxError::Closed);
        }
        Ok(paths::to_wire(&paths::resolve(&self.work_dir, path)))
    }
}

#[async_trait]
impl SandboxFiles for DockerFiles {
    async fn create(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        let result = self
            .container
            .script(
                r#"mkdir -p -- "$(dirname -- "$1")" && printf '%s' "$2" > "$1""#,
                &[&target, content],
            )
            .await?;

        if result.failed() {
            return Err(RunboxError::WriteFailed {
                path: target,
                status: None,
                body: result.stderr,
            });
        }
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        let result = self.container.script(r#"mkdir -p -- "$1""#, &[&target]).await?;

        if result.failed() {
            return Err(RunboxError::MakeDirFailed {
                path: target,
                status: None,
                body: result.stderr,
            });
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        let result = self
            .container
            .script(r#"test -e "$1" || exit 3; cat -- "$1""#, &[&target])
            .await?;

        match result.exit_code {
            0 => Ok(result.stdout),
            EXIT_NOT_FOUND => Err(RunboxError::PathNotFound { path: target }),
            _ => Err(RunboxError::ReadFailed {
                path: target,
                status: None,
                body: result.stderr,
            }),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        let Ok(target) = self.resolve(path) else {
            return false;
        };
        match self.container.script(r#"test -e "$1""#, &[&target]).await {
            Ok(result) => result.success(),
            Err(_) => false,
        }
    }

    async fn list_with_depth(&self, path: &str, max_depth: u32) -> Result<Vec<FileEntry>> {
        let target = self.resolve(path)?;
        let max_depth = max_depth.to_string();
        let result = self
            .container
            .script(
                r#"test -e "$1" || exit 3
test -d "$1" || exit 4
if [ "$2" = "0" ]; then
  find "$1" -mindepth 1 -printf '%y|%s|%T@|%p\n'
else
  find "$1" -mindepth 1 -maxdepth "$2" -printf '%y|%s|%T@|%p\n'
fi"#,
                &[&target, &max_depth],
            )
            .await?;

        match result.exit_code {
            0 => {}
            EXIT_NOT_FOUND => return Err(RunboxError::PathNotFound { path: target }),
            EXIT_NOT_A_DIRECTORY => return Err(RunboxError::NotADirectory { path: target }),
            _ => {
                return Err(RunboxError::ListFailed {
                    path: target,
                    status: None,
                    body: result.stderr,
                })
            }
        }

        let mut entries = parse_find_output(&self.work_dir, &result.stdout);
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;
        let script = if recursive {
            r#"test -e "$1" || test -L "$1" || exit 3; rm -rf -- "$1""#
        } else {
            r#"test -e "$1" || test -L "$1" || exit 3
if [ -d "$1" ] && [ ! -L "$1" ]; then rmdir -- "$1"; else rm -f -- "$1"; fi"#
        };
        let result = self.container.script(script, &[&target]).await?;

        match result.exit_code {
            0 => Ok(()),
            EXIT_NOT_FOUND => Err(RunboxError::PathNotFound { path: target }),
            _ => Err(RunboxError::RemoveFailed {
                path: target,
                status: None,
                body: result.stderr,
            }),
        }
    }
}

/// Parse `find -printf '%y|%s|%T@|%p\n'` lines into entries.
fn parse_find_output(work_dir: &Path, output: &str) -> Vec<FileEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '|');
            let kind = parts.next()?;
            let size: u64 = parts.next()?.parse().unwrap_or(0);
            let mtime = parts.next()?;
            let path = parts.next()?;

            let is_dir = kind == "d";
            let full = Path::new(path);
            Some(FileEntry {
                name: full
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                file_type: if is_dir {
                    FileType::Directory
                } else {
                    FileType::File
                },
                path: paths::relative_to(work_dir, full),
                size: if is_dir { 0 } else { size },
                modified: parse_epoch(mtime).unwrap_or_else(Utc::now),
            })
        })
        .collect()
}

/// `%T@` prints fractional epoch seconds, e.g. `1700000000.1234567890`.
fn parse_epoch(text: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
    let secs: i64 = secs.parse().ok()?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().take(9).collect();
        format!("{:0<9}", digits).parse().ok()?
    };
    Utc.timestamp_opt(secs, nanos).single()
}
