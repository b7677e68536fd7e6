use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunboxError};

/// What to run: a literal argument vector or a script for the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    Argv(Vec<String>),
    Shell(String),
}

/// A single command request.
///
/// Built per call and never mutated once handed to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: ExecCommand,
    /// Environment overlay applied on top of the sandbox environment
    pub env: BTreeMap<String, String>,
    /// Working directory override, resolved against the sandbox work dir
    pub work_dir: Option<PathBuf>,
    /// Upper bound for the whole call; backends fall back to their default
    pub timeout: Option<Duration>,
}

impl ExecSpec {
    /// Run a program with arguments, e.g. `ExecSpec::argv(["echo", "hi"])`.
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_command(ExecCommand::Argv(args.into_iter().map(Into::into).collect()))
    }

    /// Run a script through the sandbox shell.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::from_command(ExecCommand::Shell(script.into()))
    }

    fn from_command(command: ExecCommand) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            work_dir: None,
            timeout: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject specs no backend can run.
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            ExecCommand::Argv(args) if args.is_empty() => {
                return Err(RunboxError::InvalidSpec(
                    "command cannot be empty".to_string(),
                ))
            }
            ExecCommand::Argv(args) if args[0].is_empty() => {
                return Err(RunboxError::InvalidSpec(
                    "program name cannot be empty".to_string(),
                ))
            }
            ExecCommand::Shell(script) if script.trim().is_empty() => {
                return Err(RunboxError::InvalidSpec(
                    "shell script cannot be empty".to_string(),
                ))
            }
            _ => {}
        }

        if let Some(key) = self.env.keys().find(|key| !is_env_name(key)) {
            return Err(RunboxError::InvalidSpec(format!(
                "invalid environment variable name: {:?}",
                key
            )));
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, the names every shell can export.
fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Outcome of one completed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn failed(&self) -> bool {
        !self.success()
    }

    /// Stdout followed by stderr. Not a temporal interleave.
    pub fn merged_log(&self) -> String {
        let mut log = String::with_capacity(self.stdout.len() + self.stderr.len());
        log.push_str(&self.stdout);
        log.push_str(&self.stderr);
        log
    }

    pub fn has_output(&self) -> bool {
        self.has_stdout() || self.has_stderr()
    }

    pub fn has_stdout(&self) -> bool {
        !self.stdout.is_empty()
    }

    pub fn has_stderr(&self) -> bool {
        !self.stderr.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "exit_code={} success={} duration={:?} stdout_len={} stderr_len={}",
            self.exit_code,
            self.success(),
            self.duration,
            self.stdout.len(),
            self.stderr.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub file_type: FileType,
    /// Path relative to the sandbox work dir
    pub path: String,
    /// Size in bytes, 0 for directories
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileEntry {
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// A file to create during sandbox setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub content: String,
}

impl FileSpec {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_builder() {
        let spec = ExecSpec::argv(["printenv", "TEST_VAR"])
            .with_env("TEST_VAR", "test-value")
            .with_timeout(Duration::from_secs(30));
        assert_eq!(
            spec.command,
            ExecCommand::Argv(vec!["printenv".to_string(), "TEST_VAR".to_string()])
        );
        assert_eq!(spec.env.get("TEST_VAR").map(String::as_str), Some("test-value"));
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_env_keys_are_unique() {
        let spec = ExecSpec::shell("env")
            .with_env("A", "1")
            .with_envs([("A", "2"), ("B", "3")]);
        assert_eq!(spec.env.len(), 2);
        assert_eq!(spec.env["A"], "2");
    }

    #[test]
    fn test_empty_commands_are_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            ExecSpec::argv(empty).validate(),
            Err(RunboxError::InvalidSpec(_))
        ));
        assert!(ExecSpec::shell("   ").validate().is_err());
    }

    #[test]
    fn test_invalid_env_names_are_rejected() {
        for key in ["BAD-NAME", "1ST", "", "A B"] {
            let spec = ExecSpec::argv(["env"]).with_env(key, "x");
            assert!(
                matches!(spec.validate(), Err(RunboxError::InvalidSpec(_))),
                "{:?} accepted",
                key
            );
        }
        assert!(ExecSpec::argv(["env"])
            .with_env("_private", "1")
            .with_env("PATH2", "2")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_merged_log_is_concatenation() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            duration: Duration::from_millis(5),
        };
        assert_eq!(result.merged_log(), "out\nerr\n");
        assert!(result.has_output());
        assert!(result.success());
        assert!(result.summary().contains("stdout_len=4"));
    }
}
