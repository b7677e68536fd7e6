use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LocalConfig;
use crate::error::{Result, RunboxError};
use crate::sandbox::paths;
use crate::sandbox::traits::{Sandbox, SandboxFiles};
use crate::sandbox::types::{ExecCommand, ExecResult, ExecSpec, FileEntry, FileType};

/// Timeout applied when an `ExecSpec` carries none.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Sandbox backed by host processes in a working directory.
///
/// Provides no isolation at all; it exists for development and as the
/// reference implementation the other backends are measured against.
pub struct LocalSandbox {
    work_dir: PathBuf,
    /// Owned temporary directory, removed on close
    temp_dir: Mutex<Option<TempDir>>,
    files: LocalFiles,
    closed: Arc<AtomicBool>,
}

impl LocalSandbox {
    /// Create a sandbox rooted at `config.work_dir`, or at a fresh temporary
    /// directory when none is configured.
    pub fn new(config: &LocalConfig) -> Result<Self> {
        match &config.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(Self::rooted(std::fs::canonicalize(dir)?, None))
            }
            None => Self::temp(),
        }
    }

    /// Create a sandbox in a new temporary directory.
    pub fn temp() -> Result<Self> {
        let temp = tempfile::Builder::new().prefix("runbox-").tempdir()?;
        let root = std::fs::canonicalize(temp.path())?;
        Ok(Self::rooted(root, Some(temp)))
    }

    fn rooted(work_dir: PathBuf, temp_dir: Option<TempDir>) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        info!(work_dir = %work_dir.display(), temporary = temp_dir.is_some(), "Local sandbox created");
        Self {
            files: LocalFiles {
                work_dir: work_dir.clone(),
                closed: Arc::clone(&closed),
            },
            work_dir,
            temp_dir: Mutex::new(temp_dir),
            closed,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunboxError::Closed);
        }
        Ok(())
    }

    fn command_for(&self, spec: &ExecSpec) -> Command {
        let mut cmd = match &spec.command {
            ExecCommand::Argv(args) => {
                let mut cmd = Command::new(&args[0]);
                cmd.args(&args[1..]);
                cmd
            }
            ExecCommand::Shell(script) => {
                let mut cmd = Command::new("bash");
                cmd.args(["-c", script]);
                cmd
            }
        };

        let cwd = match &spec.work_dir {
            Some(dir) => paths::resolve(&self.work_dir, &dir.to_string_lossy()),
            None => self.work_dir.clone(),
        };
        cmd.current_dir(cwd);
        cmd.envs(&spec.env);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn execute(&self, spec: &ExecSpec) -> Result<ExecResult> {
        self.ensure_open()?;
        spec.validate()?;

        let timeout = spec.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        debug!(command = ?spec.command, "Executing command in local sandbox");

        let started = Instant::now();
        let child = self
            .command_for(spec)
            .spawn()
            .map_err(|e| RunboxError::ExecutionFailed {
                status: None,
                body: format!("failed to spawn process: {}", e),
            })?;

        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Local command timed out");
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

    fn files(&self) -> Result<&dyn SandboxFiles> {
        self.ensure_open()?;
        Ok(&self.files)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let temp = match self.temp_dir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(temp) = temp {
            temp.close()?;
        }

        info!(work_dir = %self.work_dir.display(), "Local sandbox closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct LocalFiles {
    work_dir: PathBuf,
    closed: Arc<AtomicBool>,
}

impl LocalFiles {
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunboxError::Closed);
        }
        Ok(paths::resolve(&self.work_dir, path))
    }
}

fn not_found(err: std::io::Error, path: &Path) -> RunboxError {
    if err.kind() == ErrorKind::NotFound {
        RunboxError::PathNotFound {
            path: path.display().to_string(),
        }
    } else {
        RunboxError::Io(err)
    }
}

#[async_trait]
impl SandboxFiles for LocalFiles {
    async fn create(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        debug!(path = %target.display(), bytes = content.len(), "Wrote file");
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|e| not_found(e, &target))
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(target) => tokio::fs::try_exists(&target).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn list_with_depth(&self, path: &str, max_depth: u32) -> Result<Vec<FileEntry>> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| not_found(e, &target))?;
        if !meta.is_dir() {
            return Err(RunboxError::NotADirectory {
                path: target.display().to_string(),
            });
        }

        let work_dir = self.work_dir.clone();
        let limit = if max_depth == 0 { None } else { Some(max_depth) };
        let entries = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk(&work_dir, &target, 1, limit, &mut out)?;
            Ok::<_, std::io::Error>(out)
        })
        .await
        .map_err(|e| RunboxError::Io(std::io::Error::new(ErrorKind::Other, e)))??;

        Ok(entries)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&target)
            .await
            .map_err(|e| not_found(e, &target))?;

        if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&target).await?;
            } else {
                tokio::fs::remove_dir(&target).await?;
            }
        } else {
            tokio::fs::remove_file(&target).await?;
        }

        debug!(path = %target.display(), recursive = recursive, "Deleted path");
        Ok(())
    }
}

/// Collect entries under `dir`, depth-first, sorted by name at each level.
fn walk(
    work_dir: &Path,
    dir: &Path,
    depth: u32,
    limit: Option<u32>,
    out: &mut Vec<FileEntry>,
) -> std::io::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let path = child.path();
        let meta = std::fs::metadata(&path).or_else(|_| child.metadata())?;
        let is_dir = meta.is_dir();

        out.push(FileEntry {
            name: child.file_name().to_string_lossy().into_owned(),
            file_type: if is_dir {
                FileType::Directory
            } else {
                FileType::File
            },
            path: paths::relative_to(work_dir, &path),
            size: if is_dir { 0 } else { meta.len() },
            modified: meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        });

        let descend = limit.map_or(true, |max| depth < max);
        if descend && child.file_type()?.is_dir() {
            walk(work_dir, &path, depth + 1, limit, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_argv_runs_without_shell() {
        let sandbox = LocalSandbox::temp().unwrap();
        let result = sandbox
            .execute(&ExecSpec::argv(["echo", "$HOME"]))
            .await
            .unwrap();
        assert_eq!(result.stdout, "$HOME\n");
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_temp_dir_removed_on_close() {
        let sandbox = LocalSandbox::temp().unwrap();
        let root = sandbox.work_dir().to_path_buf();
        assert!(root.exists());

        sandbox.close().await.unwrap();
        assert!(!root.exists());
        assert!(sandbox.is_closed());
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_dir_is_kept() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("work");
        let sandbox = LocalSandbox::new(&LocalConfig {
            work_dir: Some(dir.clone()),
        })
        .unwrap();

        sandbox.files().unwrap().create("a.txt", "x").await.unwrap();
        sandbox.close().await.unwrap();
        assert!(dir.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_depth_limited_walk() {
        let sandbox = LocalSandbox::temp().unwrap();
        let files = sandbox.files().unwrap();
        files.create("a/b/c/deep.txt", "deep").await.unwrap();
        files.create("top.txt", "top").await.unwrap();

        let shallow = files.list(".").await.unwrap();
        let names: Vec<_> = shallow.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["a", "top.txt"]);
        assert_eq!(shallow[1].size, 3);

        let two = files.list_with_depth(".", 2).await.unwrap();
        assert!(two.iter().any(|e| e.path == "a/b"));
        assert!(!two.iter().any(|e| e.path == "a/b/c"));

        let all = files.list_with_depth(".", 0).await.unwrap();
        assert!(all.iter().any(|e| e.path == "a/b/c/deep.txt" && e.is_file()));

        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_recursive_delete_of_full_dir_fails() {
        let sandbox = LocalSandbox::temp().unwrap();
        let files = sandbox.files().unwrap();
        files.create("d/f.txt", "x").await.unwrap();

        assert!(files.delete("d", false).await.is_err());
        assert!(files.exists("d/f.txt").await);
        sandbox.close().await.unwrap();
    }
}
