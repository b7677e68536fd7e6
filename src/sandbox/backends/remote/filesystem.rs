use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use super::api::body_text;
use super::envd::EnvdTransport;
use crate::error::{Result, RunboxError};
use crate::sandbox::types::{FileEntry, FileType};

const LIST_DIR_PATH: &str = "/filesystem.Filesystem/ListDir";
const STAT_PATH: &str = "/filesystem.Filesystem/Stat";
const REMOVE_PATH: &str = "/filesystem.Filesystem/Remove";
const MAKE_DIR_PATH: &str = "/filesystem.Filesystem/MakeDir";
const FILES_PATH: &str = "/files";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ListDirResponse {
    #[serde(default)]
    entries: Vec<EntryInfo>,
}

#[derive(Debug, Deserialize)]
struct EntryInfo {
    name: String,
    #[serde(rename = "type")]
    file_type: Option<String>,
    path: String,
    #[serde(default)]
    size: Option<WireSize>,
    #[serde(alias = "modifiedTime")]
    modified_time: Option<WireTimestamp>,
}

/// int64 fields come back as numbers or, in proto3 JSON, as decimal strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSize {
    Number(u64),
    Text(String),
}

impl WireSize {
    fn bytes(&self) -> u64 {
        match self {
            WireSize::Number(n) => *n,
            WireSize::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Parts {
        #[serde(default)]
        seconds: WireSeconds,
        #[serde(default)]
        nanos: u32,
    },
    Rfc3339(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum WireSeconds {
    #[default]
    Missing,
    Number(i64),
    Text(String),
}

impl WireTimestamp {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Parts { seconds, nanos } => {
                let seconds = match seconds {
                    WireSeconds::Missing => 0,
                    WireSeconds::Number(n) => *n,
                    WireSeconds::Text(s) => s.trim().parse().ok()?,
                };
                Utc.timestamp_opt(seconds, *nanos).single()
            }
            WireTimestamp::Rfc3339(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl EntryInfo {
    fn into_entry(self) -> FileEntry {
        let file_type = match self.file_type.as_deref() {
            Some("FILE_TYPE_DIRECTORY") => FileType::Directory,
            _ => FileType::File,
        };
        let size = match file_type {
            FileType::Directory => 0,
            FileType::File => self.size.as_ref().map(WireSize::bytes).unwrap_or(0),
        };
        let modified = self
            .modified_time
            .as_ref()
            .and_then(WireTimestamp::to_utc)
            .unwrap_or_else(Utc::now);

        FileEntry {
            name: self.name,
            file_type,
            path: self.path,
            size,
            modified,
        }
    }
}

fn is_not_found(status: StatusCode, body: &str) -> bool {
    let lower = body.to_lowercase();
    status == StatusCode::NOT_FOUND || lower.contains("not_found") || lower.contains("no such file")
}

fn is_not_a_directory(body: &str) -> bool {
    body.to_lowercase().contains("not a directory")
}

/// Client for the envd filesystem RPCs and the `/files` upload endpoint.
///
/// Takes absolute paths only; resolution against the work dir happens in the
/// sandbox facade. Entry paths are returned as the service reports them.
pub struct FilesystemClient {
    transport: EnvdTransport,
}

impl FilesystemClient {
    pub fn new(transport: EnvdTransport) -> Self {
        Self { transport }
    }

    pub async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let write_failed = |status: Option<u16>, body: String| RunboxError::WriteFailed {
            path: path.to_string(),
            status,
            body,
        };

        let part = Part::bytes(content.to_vec())
            .file_name(path.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part("file", part);

        let response = self
            .transport
            .request(Method::POST, FILES_PATH)
            .query(&[("path", path)])
            .multipart(form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| write_failed(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(write_failed(Some(status.as_u16()), body_text(response).await));
        }

        debug!(path = %path, bytes = content.len(), "Wrote file");
        Ok(())
    }

    pub async fn read(&self, path: &str) -> Result<String> {
        let read_failed = |status: Option<u16>, body: String| RunboxError::ReadFailed {
            path: path.to_string(),
            status,
            body,
        };

        let response = self
            .transport
            .request(Method::GET, FILES_PATH)
            .query(&[("path", path)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| read_failed(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(read_failed(Some(status.as_u16()), body_text(response).await));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| read_failed(Some(status.as_u16()), e.to_string()))?;
        debug!(path = %path, bytes = bytes.len(), "Read file");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// List `path` down to `depth` levels; 0 means unlimited.
    pub async fn list(&self, path: &str, depth: u32) -> Result<Vec<FileEntry>> {
        let list_failed = |status: Option<u16>, body: String| RunboxError::ListFailed {
            path: path.to_string(),
            status,
            body,
        };

        let response = self
            .transport
            .rpc(LIST_DIR_PATH, &json!({ "path": path, "depth": depth }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| list_failed(None, e.to_string()))?;

        let status = response.status();
        let body = body_text(response).await;
        if !status.is_success() {
            if is_not_a_directory(&body) {
                return Err(RunboxError::NotADirectory {
                    path: path.to_string(),
                });
            }
            if is_not_found(status, &body) {
                return Err(RunboxError::PathNotFound {
                    path: path.to_string(),
                });
            }
            return Err(list_failed(Some(status.as_u16()), body));
        }

        trace!(path = %path, body = %body, "ListDir response");
        let parsed: ListDirResponse = serde_json::from_str(&body).map_err(|e| {
            list_failed(
                Some(status.as_u16()),
                format!("unparseable response ({}): {}", e, body),
            )
        })?;

        let entries: Vec<FileEntry> = parsed
            .entries
            .into_iter()
            .map(EntryInfo::into_entry)
            .collect();
        debug!(path = %path, depth = depth, entries = entries.len(), "Listed directory");
        Ok(entries)
    }

    /// Whether `path` exists. Any failure reads as `false`.
    pub async fn exists(&self, path: &str) -> bool {
        let response = self
            .transport
            .rpc(STAT_PATH, &json!({ "path": path }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(path = %path, error = %e, "Stat failed, treating as absent");
                false
            }
        }
    }

    /// Remove a file or directory tree. Missing paths fail with `PathNotFound`.
    pub async fn remove(&self, path: &str) -> Result<()> {
        if !self.exists(path).await {
            return Err(RunboxError::PathNotFound {
                path: path.to_string(),
            });
        }

        let remove_failed = |status: Option<u16>, body: String| RunboxError::RemoveFailed {
            path: path.to_string(),
            status,
            body,
        };

        let response = self
            .transport
            .rpc(REMOVE_PATH, &json!({ "path": path }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| remove_failed(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = body_text(response).await;
            if is_not_found(status, &body) {
                return Err(RunboxError::PathNotFound {
                    path: path.to_string(),
                });
            }
            return Err(remove_failed(Some(status.as_u16()), body));
        }

        debug!(path = %path, "Removed path");
        Ok(())
    }

    /// Create a directory with parents. An existing directory is success.
    pub async fn make_dir(&self, path: &str) -> Result<()> {
        let response = self
            .transport
            .rpc(MAKE_DIR_PATH, &json!({ "path": path }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| RunboxError::MakeDirFailed {
                path: path.to_string(),
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(path = %path, "Created directory");
            return Ok(());
        }

        let body = body_text(response).await;
        if status == StatusCode::CONFLICT || body.contains("already_exists") {
            trace!(path = %path, "Directory already exists");
            return Ok(());
        }

        Err(RunboxError::MakeDirFailed {
            path: path.to_string(),
            status: Some(status.as_u16()),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(json: &str) -> Vec<FileEntry> {
        serde_json::from_str::<ListDirResponse>(json)
            .unwrap()
            .entries
            .into_iter()
            .map(EntryInfo::into_entry)
            .collect()
    }

    #[test]
    fn test_entry_with_timestamp_parts() {
        let list = entries(
            r#"{"entries":[
                {"name":"a.txt","type":"FILE_TYPE_FILE","path":"/home/user/a.txt","size":12,
                 "modified_time":{"seconds":1700000000,"nanos":500}},
                {"name":"d","type":"FILE_TYPE_DIRECTORY","path":"/home/user/d","size":4096,
                 "modified_time":{"seconds":1700000001,"nanos":0}}
            ]}"#,
        );
        assert_eq!(list.len(), 2);
        assert!(list[0].is_file());
        assert_eq!(list[0].size, 12);
        assert_eq!(list[0].modified.timestamp(), 1_700_000_000);
        assert_eq!(list[0].modified.timestamp_subsec_nanos(), 500);
        assert!(list[1].is_directory());
        assert_eq!(list[1].size, 0);
    }

    #[test]
    fn test_entry_with_proto_json_encoding() {
        let list = entries(
            r#"{"entries":[
                {"name":"b","type":"FILE_TYPE_FILE","path":"/home/user/b","size":"42",
                 "modifiedTime":"2024-01-02T03:04:05Z"}
            ]}"#,
        );
        assert_eq!(list[0].size, 42);
        assert_eq!(list[0].modified.to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_missing_fields_fall_back() {
        let before = Utc::now();
        let list = entries(r#"{"entries":[{"name":"x","path":"/x"}]}"#);
        assert!(list[0].is_file());
        assert_eq!(list[0].size, 0);
        assert!(list[0].modified >= before);

        assert!(entries("{}").is_empty());
    }

    #[test]
    fn test_error_classification() {
        assert!(is_not_found(StatusCode::NOT_FOUND, ""));
        assert!(is_not_found(
            StatusCode::BAD_REQUEST,
            r#"{"code":"not_found","message":"path not found"}"#
        ));
        assert!(is_not_found(
            StatusCode::INTERNAL_SERVER_ERROR,
            "open /x: no such file or directory"
        ));
        assert!(!is_not_found(StatusCode::INTERNAL_SERVER_ERROR, "disk full"));
        assert!(is_not_a_directory(
            r#"{"code":"invalid_argument","message":"path is not a directory"}"#
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service_means_absent() {
        let transport =
            EnvdTransport::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let client = FilesystemClient::new(transport);

        assert!(!client.exists("/home/user/a.txt").await);
        assert!(matches!(
            client.remove("/home/user/a.txt").await,
            Err(RunboxError::PathNotFound { .. })
        ));
    }
}
