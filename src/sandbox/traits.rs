use std::any::Any;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::types::{ExecResult, ExecSpec, FileEntry, FileSpec};

/// Downcasting hook for reaching backend-specific capabilities.
///
/// Blanket-implemented for every sandbox; callers opt in explicitly with
/// `sandbox.as_any().downcast_ref::<RemoteSandbox>()`. On a `Box<dyn Sandbox>`
/// go through `as_ref()` first, otherwise the box itself is what gets cast.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Trait for sandbox execution backends.
///
/// This trait abstracts the execution environment so that a local process,
/// a container and a remote micro-VM can be swapped without touching callers.
/// Every implementation must pass the suite in [`crate::tck`].
#[async_trait]
pub trait Sandbox: AsAny + Send + Sync {
    /// Fixed working root; relative paths and commands resolve against it.
    fn work_dir(&self) -> &Path;

    /// Run a command to completion.
    ///
    /// Fails with `Timeout` carrying the effective timeout when the deadline
    /// passes; never returns a partial result.
    async fn execute(&self, spec: &ExecSpec) -> Result<ExecResult>;

    /// File operations scoped to this sandbox. Fails with `Closed` after `close()`.
    fn files(&self) -> Result<&dyn SandboxFiles>;

    /// Release the sandbox. A second call is a no-op.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// File access inside a sandbox.
///
/// Relative paths resolve against [`Sandbox::work_dir`], `"."` is the work
/// dir itself and absolute paths are used as given.
#[async_trait]
pub trait SandboxFiles: Send + Sync {
    /// Write `content` to `path`, creating parent directories as needed.
    async fn create(&self, path: &str, content: &str) -> Result<()>;

    /// Create a directory and its parents. Existing directories are fine.
    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn setup(&self, files: &[FileSpec]) -> Result<()> {
        for file in files {
            self.create(&file.path, &file.content).await?;
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<String>;

    /// Never fails: anything other than a positive answer is `false`.
    async fn exists(&self, path: &str) -> bool;

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.list_with_depth(path, 1).await
    }

    /// List entries below `path` down to `max_depth` levels (0 = unlimited).
    async fn list_with_depth(&self, path: &str, max_depth: u32) -> Result<Vec<FileEntry>>;

    /// Remove a file or directory; `PathNotFound` if it is already gone.
    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;
}
