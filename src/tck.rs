//! Compatibility test kit for [`Sandbox`] implementations.
//!
//! Every case is a plain async function taking a fresh, open sandbox, so the
//! same suite runs unchanged against any backend. The [`sandbox_tck!`]
//! macro expands into one `#[tokio::test]` per case:
//!
//! ```ignore
//! async fn new_sandbox() -> Box<dyn runbox::Sandbox> {
//!     Box::new(runbox::sandbox::LocalSandbox::temp().unwrap())
//! }
//!
//! runbox::sandbox_tck!(new_sandbox);
//! ```
//!
//! Extra attributes such as `#[ignore]` are applied to every generated test:
//! `runbox::sandbox_tck!(new_sandbox, #[ignore]);`

use std::time::Duration;

use crate::error::RunboxError;
use crate::sandbox::{ExecSpec, FileEntry, FileSpec, Sandbox};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

fn names(entries: &[FileEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

fn entry<'a>(entries: &'a [FileEntry], name: &str) -> &'a FileEntry {
    entries
        .iter()
        .find(|e| e.name == name)
        .unwrap_or_else(|| panic!("no entry named {} in {:?}", name, names(entries)))
}

/// Close the sandbox if a case left it open.
pub async fn tear_down(sandbox: &dyn Sandbox) {
    if !sandbox.is_closed() {
        if let Err(e) = sandbox.close().await {
            tracing::warn!(error = %e, "Failed to close sandbox during tear down");
        }
    }
}

// Execution

pub async fn basic_execution(sandbox: &dyn Sandbox) {
    let spec = ExecSpec::argv(["echo", "Hello from sandbox"]).with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.success());
    assert_eq!(result.exit_code, 0);
    assert!(result.merged_log().contains("Hello from sandbox"));
    assert!(result.duration > Duration::ZERO);
    assert!(result.has_output());
}

pub async fn environment_variables(sandbox: &dyn Sandbox) {
    let spec = ExecSpec::argv(["printenv", "TEST_VAR"])
        .with_env("TEST_VAR", "test-value")
        .with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.success(), "{}", result.summary());
    assert_eq!(result.merged_log().trim(), "test-value");
}

pub async fn working_directory(sandbox: &dyn Sandbox) {
    let spec = ExecSpec::argv(["pwd"]).with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.success());
    let reported = result.merged_log();
    assert!(!reported.trim().is_empty());
    assert_eq!(reported.trim(), sandbox.work_dir().to_string_lossy());
}

pub async fn working_directory_override(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create_directory("nested/dir").await.expect("mkdir");

    let spec = ExecSpec::shell("pwd")
        .with_work_dir("nested/dir")
        .with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.success(), "{}", result.summary());
    assert_eq!(
        result.stdout.trim(),
        sandbox.work_dir().join("nested/dir").to_string_lossy()
    );
}

pub async fn timeout_handling(sandbox: &dyn Sandbox) {
    let timeout = Duration::from_secs(2);
    let spec = ExecSpec::argv(["sleep", "10"]).with_timeout(timeout);

    match sandbox.execute(&spec).await {
        Err(RunboxError::Timeout { timeout: reported }) => assert_eq!(reported, timeout),
        other => panic!("expected a timeout, got {:?}", other),
    }
}

pub async fn error_handling(sandbox: &dyn Sandbox) {
    let spec = ExecSpec::argv(["ls", "/nonexistent-directory"]).with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.failed());
    assert_ne!(result.exit_code, 0);
    assert!(result.stderr.contains("No such file or directory"));
    assert!(result.merged_log().contains("No such file or directory"));
}

pub async fn stdout_capture(sandbox: &dyn Sandbox) {
    let spec = ExecSpec::argv(["echo", "stdout-content"]).with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.success());
    assert!(result.stdout.contains("stdout-content"));
    assert!(result.has_stdout());
    assert!(result.stderr.is_empty());
    assert!(!result.has_stderr());
    assert_eq!(result.merged_log(), result.stdout);
}

pub async fn stderr_capture(sandbox: &dyn Sandbox) {
    let spec = ExecSpec::shell("echo 'error-message' >&2").with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.success());
    assert!(result.stderr.contains("error-message"));
    assert!(result.has_stderr());
    assert!(!result.stdout.contains("error-message"));
}

pub async fn mixed_stdout_stderr(sandbox: &dyn Sandbox) {
    let spec = ExecSpec::shell("echo 'to-stdout' && echo 'to-stderr' >&2")
        .with_timeout(COMMAND_TIMEOUT);
    let result = sandbox.execute(&spec).await.expect("execute");

    assert!(result.success());
    assert!(result.stdout.contains("to-stdout"));
    assert!(result.stderr.contains("to-stderr"));
    assert!(result.merged_log().contains("to-stdout"));
    assert!(result.merged_log().contains("to-stderr"));
    assert!(!result.stdout.contains("to-stderr"));
    assert!(!result.stderr.contains("to-stdout"));
}

pub async fn multiple_executions(sandbox: &dyn Sandbox) {
    for word in ["first", "second", "third"] {
        let result = sandbox
            .execute(&ExecSpec::argv(["echo", word]))
            .await
            .expect("execute");
        assert!(result.success());
        assert!(result.merged_log().contains(word));
    }
}

pub async fn invalid_spec_rejected(sandbox: &dyn Sandbox) {
    let empty: [&str; 0] = [];
    assert!(matches!(
        sandbox.execute(&ExecSpec::argv(empty)).await,
        Err(RunboxError::InvalidSpec(_))
    ));
    assert!(matches!(
        sandbox.execute(&ExecSpec::shell("  ")).await,
        Err(RunboxError::InvalidSpec(_))
    ));
    assert!(matches!(
        sandbox
            .execute(&ExecSpec::argv(["env"]).with_env("BAD-NAME", "x"))
            .await,
        Err(RunboxError::InvalidSpec(_))
    ));
}

// Lifecycle

pub async fn sandbox_state_management(sandbox: &dyn Sandbox) {
    assert!(!sandbox.is_closed());
    assert!(!sandbox.work_dir().as_os_str().is_empty());
    assert!(sandbox.work_dir().is_absolute());
}

pub async fn resource_cleanup(sandbox: &dyn Sandbox) {
    assert!(!sandbox.is_closed());
    sandbox.close().await.expect("close");
    assert!(sandbox.is_closed());
}

pub async fn close_is_idempotent(sandbox: &dyn Sandbox) {
    sandbox.close().await.expect("first close");
    sandbox.close().await.expect("second close");
    assert!(sandbox.is_closed());
}

pub async fn closed_sandbox_rejects_calls(sandbox: &dyn Sandbox) {
    sandbox.close().await.expect("close");

    assert!(matches!(
        sandbox.execute(&ExecSpec::argv(["echo", "late"])).await,
        Err(RunboxError::Closed)
    ));
    assert!(matches!(sandbox.files(), Err(RunboxError::Closed)));
}

// Files

pub async fn write_and_read(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    let content = "line one\nit's \"quoted\" $HOME `tick` \\ back\nünïcödé\n";

    files.create("docs/notes.txt", content).await.expect("create");
    assert_eq!(files.read("docs/notes.txt").await.expect("read"), content);

    let absolute = sandbox.work_dir().join("docs/notes.txt");
    assert_eq!(
        files
            .read(&absolute.to_string_lossy())
            .await
            .expect("read absolute"),
        content
    );

    files.create("docs/notes.txt", "replaced").await.expect("overwrite");
    assert_eq!(files.read("docs/notes.txt").await.expect("read"), "replaced");
}

pub async fn setup_creates_files(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files
        .setup(&[
            FileSpec::new("a.txt", "alpha"),
            FileSpec::new("src/b.txt", "beta"),
        ])
        .await
        .expect("setup");

    assert_eq!(files.read("a.txt").await.expect("read"), "alpha");
    assert_eq!(files.read("src/b.txt").await.expect("read"), "beta");

    let result = sandbox
        .execute(&ExecSpec::shell("cat src/b.txt").with_timeout(COMMAND_TIMEOUT))
        .await
        .expect("execute");
    assert_eq!(result.stdout, "beta");
}

pub async fn exists_reports_presence(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    assert!(!files.exists("missing.txt").await);

    files.create("present.txt", "x").await.expect("create");
    assert!(files.exists("present.txt").await);
    assert!(files.exists(".").await);
}

pub async fn list_directory(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create("file1.txt", "content1").await.expect("create");
    files.create("file2.txt", "content2").await.expect("create");
    files.create_directory("subdir").await.expect("mkdir");

    let entries = files.list(".").await.expect("list");
    assert!(entries.len() >= 3);
    let listed = names(&entries);
    for name in ["file1.txt", "file2.txt", "subdir"] {
        assert!(listed.contains(&name), "{} missing from {:?}", name, listed);
    }

    let file = entry(&entries, "file1.txt");
    assert!(file.is_file());
    assert_eq!(file.size, 8);
    assert_eq!(file.path, "file1.txt");

    let dir = entry(&entries, "subdir");
    assert!(dir.is_directory());
    assert_eq!(dir.size, 0);
}

pub async fn list_directory_with_depth(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create("root.txt", "root").await.expect("create");
    files.create_directory("level1").await.expect("mkdir");
    files
        .create("level1/file1.txt", "level1 content")
        .await
        .expect("create");
    files.create_directory("level1/level2").await.expect("mkdir");
    files
        .create("level1/level2/file2.txt", "level2 content")
        .await
        .expect("create");

    let depth1 = files.list_with_depth(".", 1).await.expect("list depth 1");
    let listed = names(&depth1);
    assert!(listed.contains(&"root.txt") && listed.contains(&"level1"));
    assert!(!listed.contains(&"file1.txt"));

    let depth2 = files.list_with_depth(".", 2).await.expect("list depth 2");
    let listed = names(&depth2);
    for name in ["root.txt", "level1", "file1.txt", "level2"] {
        assert!(listed.contains(&name), "{} missing from {:?}", name, listed);
    }
    assert!(!listed.contains(&"file2.txt"));
    assert_eq!(entry(&depth2, "file1.txt").path, "level1/file1.txt");

    let unlimited = files.list_with_depth(".", 0).await.expect("list unlimited");
    assert_eq!(
        entry(&unlimited, "file2.txt").path,
        "level1/level2/file2.txt"
    );
}

pub async fn list_nonexistent_directory(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    let err = files.list("nonexistent").await.expect_err("list should fail");

    assert!(err.is_not_found(), "unexpected error: {:?}", err);
    assert!(err.to_string().contains("does not exist"));
}

pub async fn list_file_not_directory(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create("afile.txt", "content").await.expect("create");

    let err = files.list("afile.txt").await.expect_err("list should fail");
    assert!(err.to_string().contains("not a directory"), "{}", err);
}

pub async fn delete_file(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create("todelete.txt", "content").await.expect("create");
    assert!(files.exists("todelete.txt").await);

    files.delete("todelete.txt", false).await.expect("delete");
    assert!(!files.exists("todelete.txt").await);
}

pub async fn delete_empty_directory(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create_directory("emptydir").await.expect("mkdir");
    assert!(files.exists("emptydir").await);

    files.delete("emptydir", false).await.expect("delete");
    assert!(!files.exists("emptydir").await);
}

pub async fn delete_directory_recursive(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create_directory("dirwithcontent").await.expect("mkdir");
    files
        .create("dirwithcontent/file1.txt", "content1")
        .await
        .expect("create");
    files
        .create("dirwithcontent/file2.txt", "content2")
        .await
        .expect("create");
    files
        .create("dirwithcontent/subdir/nested.txt", "nested")
        .await
        .expect("create");
    assert!(files.exists("dirwithcontent/subdir/nested.txt").await);

    files.delete("dirwithcontent", true).await.expect("delete");
    assert!(!files.exists("dirwithcontent").await);
    assert!(!files.exists("dirwithcontent/subdir/nested.txt").await);
}

pub async fn delete_non_empty_directory_requires_recursive(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create("keep/inner.txt", "x").await.expect("create");

    assert!(files.delete("keep", false).await.is_err());
    assert!(files.exists("keep/inner.txt").await);
}

pub async fn delete_nonexistent(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    let err = files
        .delete("nonexistent", false)
        .await
        .expect_err("delete should fail");

    assert!(err.is_not_found(), "unexpected error: {:?}", err);
    assert!(err.to_string().contains("does not exist"));
}

pub async fn delete_sequence(sandbox: &dyn Sandbox) {
    let files = sandbox.files().expect("files");
    files.create("chain1.txt", "content1").await.expect("create");
    files.create("chain2.txt", "content2").await.expect("create");

    files.delete("chain1.txt", false).await.expect("delete");
    files.delete("chain2.txt", false).await.expect("delete");

    assert!(!files.exists("chain1.txt").await);
    assert!(!files.exists("chain2.txt").await);
}

/// Generate one `#[tokio::test]` per compatibility case.
///
/// `$factory` is an async fn returning a fresh sandbox in a box (anything
/// with `as_ref() -> &dyn Sandbox`).
#[macro_export]
macro_rules! sandbox_tck {
    (@cases $factory:path; [$($attrs:tt)*]) => {
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; basic_execution);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; environment_variables);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; working_directory);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; working_directory_override);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; timeout_handling);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; error_handling);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; stdout_capture);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; stderr_capture);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; mixed_stdout_stderr);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; multiple_executions);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; invalid_spec_rejected);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; sandbox_state_management);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; resource_cleanup);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; close_is_idempotent);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; closed_sandbox_rejects_calls);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; write_and_read);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; setup_creates_files);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; exists_reports_presence);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; list_directory);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; list_directory_with_depth);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; list_nonexistent_directory);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; list_file_not_directory);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; delete_file);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; delete_empty_directory);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; delete_directory_recursive);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; delete_non_empty_directory_requires_recursive);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; delete_nonexistent);
        $crate::sandbox_tck!(@case $factory; [$($attrs)*]; delete_sequence);
    };
    (@case $factory:path; [$(#[$($meta:tt)*])*]; $case:ident) => {
        #[tokio::test]
        $(#[$($meta)*])*
        async fn $case() {
            let sandbox = $factory().await;
            $crate::tck::$case(sandbox.as_ref()).await;
            $crate::tck::tear_down(sandbox.as_ref()).await;
        }
    };
    ($factory:path) => {
        $crate::sandbox_tck!(@cases $factory; []);
    };
    ($factory:path, $(#[$($meta:tt)*])+) => {
        $crate::sandbox_tck!(@cases $factory; [$(#[$($meta)*])+]);
    };
}
