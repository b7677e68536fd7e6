use std::time::Duration;

use thiserror::Error;

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "no status".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum RunboxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend '{backend}' is not available: {reason}")]
    BackendNotAvailable { backend: String, reason: String },

    // Contract misuse
    #[error("Invalid exec spec: {0}")]
    InvalidSpec(String),

    #[error("Sandbox is closed")]
    Closed,

    // Lifecycle errors
    #[error("Failed to create sandbox ({}): {body}", status_label(.status))]
    CreationFailed { status: Option<u16>, body: String },

    #[error("Failed to reconnect to sandbox {id} ({}): {body}", status_label(.status))]
    ReconnectFailed {
        id: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Failed to destroy sandbox {id} ({}): {body}", status_label(.status))]
    DestroyFailed {
        id: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Failed to extend timeout of sandbox {id} ({}): {body}", status_label(.status))]
    ExtendTimeoutFailed {
        id: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Sandbox service at {url} did not become ready within {waited:?}")]
    NotReady { url: String, waited: Duration },

    // Execution errors
    #[error("Command execution failed ({}): {body}", status_label(.status))]
    ExecutionFailed { status: Option<u16>, body: String },

    #[error("Command execution timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Transport interrupted: {0}")]
    TransportInterrupted(String),

    // File errors
    #[error("Path does not exist: {path}")]
    PathNotFound { path: String },

    #[error("Path is not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Failed to write file {path} ({}): {body}", status_label(.status))]
    WriteFailed {
        path: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Failed to read file {path} ({}): {body}", status_label(.status))]
    ReadFailed {
        path: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Failed to list directory {path} ({}): {body}", status_label(.status))]
    ListFailed {
        path: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Failed to remove {path} ({}): {body}", status_label(.status))]
    RemoveFailed {
        path: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Failed to create directory {path} ({}): {body}", status_label(.status))]
    MakeDirFailed {
        path: String,
        status: Option<u16>,
        body: String,
    },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RunboxError {
    /// True for the normalized "path does not exist" outcome of file operations.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PathNotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, RunboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_status_and_body() {
        let err = RunboxError::CreationFailed {
            status: Some(400),
            body: "bad template".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to create sandbox (400): bad template");

        let err = RunboxError::ExecutionFailed {
            status: None,
            body: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("no status"));
    }

    #[test]
    fn test_not_found_wording() {
        let err = RunboxError::PathNotFound {
            path: "/home/user/missing".to_string(),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("does not exist"));
        assert!(err.to_string().contains("/home/user/missing"));

        let err = RunboxError::NotADirectory {
            path: "afile.txt".to_string(),
        };
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_timeout_carries_duration() {
        let err = RunboxError::Timeout {
            timeout: Duration::from_secs(2),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Command execution timed out after 2s");
    }
}
