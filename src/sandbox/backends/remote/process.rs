//! Running commands through the envd process service.
//!
//! A call is one server-streaming RPC: the request carries the command, the
//! response body is a sequence of enveloped `start`/`data`/`end` events
//! followed by an end-of-stream trailer.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::api::body_text;
use super::envd::{EnvdTransport, CONNECT_PROTOCOL_HEADER, CONNECT_PROTOCOL_VERSION};
use super::envelope::{self, Frame};
use crate::error::{Result, RunboxError};
use crate::sandbox::types::ExecResult;

const START_PATH: &str = "/process.Process/Start";
const CONNECT_STREAM_CONTENT_TYPE: &str = "application/connect+json";
const CONNECT_ENCODING_HEADER: &str = "Connect-Content-Encoding";
const SHELL: &str = "/bin/bash";

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    process: ProcessConfig<'a>,
    stdin: bool,
}

#[derive(Debug, Serialize)]
struct ProcessConfig<'a> {
    cmd: &'a str,
    args: Vec<&'a str>,
    envs: BTreeMap<String, String>,
    cwd: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    event: Option<ProcessEvent>,
}

#[derive(Debug, Deserialize)]
struct ProcessEvent {
    start: Option<StartEvent>,
    data: Option<DataEvent>,
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct StartEvent {
    pid: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    stdout: Option<String>,
    stderr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EndEvent {
    #[serde(alias = "exitCode")]
    exit_code: Option<i32>,
    #[serde(default)]
    exited: bool,
    status: Option<String>,
}

impl EndEvent {
    fn exit_code(&self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        if let Some(code) = self
            .status
            .as_deref()
            .and_then(|s| s.strip_prefix("exit status "))
            .and_then(|s| s.trim().parse().ok())
        {
            return code;
        }
        if self.exited {
            0
        } else {
            -1
        }
    }
}

#[derive(Debug, Deserialize)]
struct Trailer {
    error: Option<TrailerError>,
}

#[derive(Debug, Deserialize)]
struct TrailerError {
    code: Option<String>,
    message: Option<String>,
}

/// Output and exit status assembled from one event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Client for `process.Process/Start`.
pub struct ProcessClient {
    transport: EnvdTransport,
}

impl ProcessClient {
    pub fn new(transport: EnvdTransport) -> Self {
        Self { transport }
    }

    /// Run `script` with `bash -l -c` in `cwd`, bounded by `timeout` end to end.
    pub async fn run(&self, script: &str, cwd: &Path, timeout: Duration) -> Result<ExecResult> {
        let cwd = cwd.to_string_lossy();
        let request = StartRequest {
            process: ProcessConfig {
                cmd: SHELL,
                args: vec!["-l", "-c", script],
                envs: BTreeMap::new(),
                cwd: &cwd,
            },
            stdin: false,
        };
        let payload = serde_json::to_vec(&request)?;
        let body = envelope::encode(&payload).map_err(|e| RunboxError::ExecutionFailed {
            status: None,
            body: e.to_string(),
        })?;

        debug!(cwd = %cwd, timeout_ms = timeout.as_millis() as u64, "Starting remote process");
        trace!(script = %script, "Remote process script");

        let started = Instant::now();
        let call = async {
            let response = self
                .transport
                .request(Method::POST, START_PATH)
                .header(CONTENT_TYPE, CONNECT_STREAM_CONTENT_TYPE)
                .header(CONNECT_PROTOCOL_HEADER, CONNECT_PROTOCOL_VERSION)
                .header(CONNECT_ENCODING_HEADER, "identity")
                .body(body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(RunboxError::ExecutionFailed {
                    status: Some(status.as_u16()),
                    body: body_text(response).await,
                });
            }

            response.bytes().await.map_err(transport_error)
        };

        let bytes = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Remote process timed out");
                return Err(RunboxError::Timeout { timeout });
            }
        };
        let duration = started.elapsed();

        let outcome = parse_stream(&bytes)?;
        debug!(
            exit_code = outcome.exit_code,
            elapsed_ms = duration.as_millis() as u64,
            "Remote process finished"
        );

        Ok(ExecResult {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration,
        })
    }
}

fn transport_error(e: reqwest::Error) -> RunboxError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        RunboxError::ExecutionFailed {
            status: None,
            body: e.to_string(),
        }
    } else {
        RunboxError::TransportInterrupted(e.to_string())
    }
}

/// Assemble a complete response body into an outcome.
///
/// Fails when the body is not a valid frame sequence, an event is not JSON,
/// or the stream ends without an `end` event.
pub fn parse_stream(body: &[u8]) -> Result<StreamOutcome> {
    let frames = envelope::decode(body).map_err(|e| RunboxError::ExecutionFailed {
        status: None,
        body: format!("malformed response stream: {}", e),
    })?;
    assemble(frames)
}

fn assemble(frames: Vec<Frame>) -> Result<StreamOutcome> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut end: Option<EndEvent> = None;
    let mut trailer_error: Option<String> = None;

    for frame in frames {
        if frame.is_trailer() {
            trailer_error = trailer_message(&frame.payload);
            continue;
        }

        let message: StreamMessage =
            serde_json::from_slice(&frame.payload).map_err(|e| RunboxError::ExecutionFailed {
                status: None,
                body: format!(
                    "malformed event ({}): {}",
                    e,
                    String::from_utf8_lossy(&frame.payload)
                ),
            })?;

        let Some(event) = message.event else {
            continue;
        };
        if let Some(start) = event.start {
            debug!(pid = ?start.pid, "Remote process started");
        }
        if let Some(data) = event.data {
            if let Some(chunk) = data.stdout {
                stdout.extend(decode_chunk(&chunk));
            }
            if let Some(chunk) = data.stderr {
                stderr.extend(decode_chunk(&chunk));
            }
        }
        if let Some(ev) = event.end {
            end = Some(ev);
        }
    }

    let end = match (end, trailer_error) {
        (Some(end), _) => end,
        (None, Some(message)) => {
            return Err(RunboxError::ExecutionFailed {
                status: None,
                body: message,
            })
        }
        (None, None) => {
            return Err(RunboxError::ExecutionFailed {
                status: None,
                body: "response stream ended without an end event".to_string(),
            })
        }
    };

    Ok(StreamOutcome {
        exit_code: end.exit_code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Base64 payload bytes; text that is not base64 is kept as is.
fn decode_chunk(chunk: &str) -> Vec<u8> {
    match BASE64.decode(chunk) {
        Ok(bytes) => bytes,
        Err(_) => chunk.as_bytes().to_vec(),
    }
}

fn trailer_message(payload: &[u8]) -> Option<String> {
    let trailer: Trailer = serde_json::from_slice(payload).ok()?;
    let error = trailer.error?;
    Some(match (error.code, error.message) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (None, Some(message)) => message,
        (Some(code), None) => code,
        (None, None) => "stream ended with an unspecified error".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::remote::envelope::{encode, encode_with_flags, FLAG_END_STREAM};

    fn frame(json: &str) -> Vec<u8> {
        encode(json.as_bytes()).unwrap()
    }

    fn b64(text: &str) -> String {
        BASE64.encode(text)
    }

    fn body(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn test_start_request_shape() {
        let request = StartRequest {
            process: ProcessConfig {
                cmd: SHELL,
                args: vec!["-l", "-c", "echo hi"],
                envs: BTreeMap::new(),
                cwd: "/home/user",
            },
            stdin: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["process"]["cmd"], "/bin/bash");
        assert_eq!(json["process"]["args"][2], "echo hi");
        assert_eq!(json["process"]["cwd"], "/home/user");
        assert!(json["process"]["envs"].as_object().unwrap().is_empty());
        assert_eq!(json["stdin"], false);
    }

    #[test]
    fn test_full_stream() {
        let body = body(&[
            frame(r#"{"event":{"start":{"pid":42}}}"#),
            frame(&format!(r#"{{"event":{{"data":{{"stdout":"{}"}}}}}}"#, b64("Hello "))),
            frame(&format!(r#"{{"event":{{"data":{{"stderr":"{}"}}}}}}"#, b64("warn\n"))),
            frame(&format!(r#"{{"event":{{"data":{{"stdout":"{}"}}}}}}"#, b64("World\n"))),
            frame(r#"{"event":{"end":{"exited":true,"status":"exit status 0"}}}"#),
            encode_with_flags(FLAG_END_STREAM, b"{}").unwrap(),
        ]);

        let outcome = parse_stream(&body).unwrap();
        assert_eq!(outcome.stdout, "Hello World\n");
        assert_eq!(outcome.stderr, "warn\n");
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn test_exit_code_spellings() {
        for json in [
            r#"{"event":{"end":{"exit_code":3}}}"#,
            r#"{"event":{"end":{"exitCode":3,"exited":true}}}"#,
            r#"{"event":{"end":{"exited":true,"status":"exit status 3"}}}"#,
        ] {
            assert_eq!(parse_stream(&frame(json)).unwrap().exit_code, 3, "{}", json);
        }
    }

    #[test]
    fn test_exit_code_fallbacks() {
        let end = EndEvent {
            exited: true,
            status: Some("signal: killed".to_string()),
            ..EndEvent::default()
        };
        assert_eq!(end.exit_code(), 0);
        assert_eq!(EndEvent::default().exit_code(), -1);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let bytes = "héllo".as_bytes();
        let (a, b) = bytes.split_at(2);
        let body = body(&[
            frame(&format!(r#"{{"event":{{"data":{{"stdout":"{}"}}}}}}"#, BASE64.encode(a))),
            frame(&format!(r#"{{"event":{{"data":{{"stdout":"{}"}}}}}}"#, BASE64.encode(b))),
            frame(r#"{"event":{"end":{"exitCode":0}}}"#),
        ]);
        assert_eq!(parse_stream(&body).unwrap().stdout, "héllo");
    }

    #[test]
    fn test_non_base64_chunk_is_kept_verbatim() {
        let body = body(&[
            frame(r#"{"event":{"data":{"stdout":"not base64!"}}}"#),
            frame(r#"{"event":{"end":{"exitCode":0}}}"#),
        ]);
        assert_eq!(parse_stream(&body).unwrap().stdout, "not base64!");
    }

    #[test]
    fn test_missing_end_event_fails() {
        let body = frame(&format!(
            r#"{{"event":{{"data":{{"stdout":"{}"}}}}}}"#,
            b64("partial")
        ));
        assert!(matches!(
            parse_stream(&body),
            Err(RunboxError::ExecutionFailed { .. })
        ));
    }

    #[test]
    fn test_trailer_error_without_end() {
        let body = body(&[
            frame(r#"{"event":{"start":{"pid":7}}}"#),
            encode_with_flags(
                FLAG_END_STREAM,
                br#"{"error":{"code":"internal","message":"process crashed"}}"#,
            )
            .unwrap(),
        ]);
        match parse_stream(&body) {
            Err(RunboxError::ExecutionFailed { body, .. }) => {
                assert_eq!(body, "internal: process crashed")
            }
            other => panic!("expected ExecutionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_body_fails() {
        let mut body = frame(r#"{"event":{"end":{"exitCode":0}}}"#);
        body.truncate(10);
        assert!(matches!(
            parse_stream(&body),
            Err(RunboxError::ExecutionFailed { .. })
        ));
    }

    #[test]
    fn test_malformed_event_fails() {
        assert!(parse_stream(&frame("not json")).is_err());
    }

    #[test]
    fn test_keepalive_events_are_ignored() {
        let body = body(&[
            frame(r#"{"event":{"keepalive":{}}}"#),
            frame(r#"{}"#),
            frame(r#"{"event":{"end":{"exitCode":1}}}"#),
        ]);
        let outcome = parse_stream(&body).unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.stdout.is_empty());
    }
}
