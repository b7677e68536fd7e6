//! In-process stand-in for the remote sandbox control plane and the envd
//! service that runs inside each sandbox.
//!
//! One server answers both surfaces, backed by a directory on the host:
//!
//! - `POST /sandboxes`, `POST /sandboxes/:id/connect`,
//!   `POST /sandboxes/:id/timeout`, `DELETE /sandboxes/:id`
//! - `GET /health`
//! - `POST /process.Process/Start` (enveloped event stream)
//! - `POST /filesystem.Filesystem/{ListDir,Stat,Remove,MakeDir}`
//! - `POST /files?path=` (multipart upload), `GET /files?path=`
//!
//! Commands run as host processes, so this is a protocol double, not a sandbox.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const API_KEY_HEADER: &str = "x-api-key";
const ACCESS_TOKEN_HEADER: &str = "x-access-token";
const FLAG_END_STREAM: u8 = 0x02;
const CHUNK_SIZE: usize = 1024;

/// Server settings.
#[derive(Debug, Clone)]
pub struct StubOptions {
    /// Address to bind; port 0 picks a free port
    pub addr: SocketAddr,
    /// Backing directory; a temporary one is created when unset
    pub root: Option<PathBuf>,
    /// Lifecycle calls must carry this key when set
    pub api_key: Option<String>,
    /// Token handed out as `envdAccessToken` and required on envd calls
    pub access_token: String,
    /// Number of health probes answered with 502 before reporting ready
    pub unhealthy_polls: u32,
    /// Fail every process start with this error in the stream trailer
    pub process_error: Option<String>,
    /// Delete the target right before `Remove` runs, as a concurrent client would
    pub racing_remove: bool,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            root: None,
            api_key: None,
            access_token: "stub-access-token".to_string(),
            unhealthy_polls: 0,
            process_error: None,
            racing_remove: false,
        }
    }
}

struct StubState {
    root: PathBuf,
    _temp: Option<TempDir>,
    api_key: Option<String>,
    access_token: String,
    unhealthy_polls: u32,
    health_polls: AtomicU32,
    process_error: Option<String>,
    racing_remove: bool,
    next_id: AtomicU64,
    /// Live sandboxes and their current timeout in seconds
    sandboxes: Mutex<BTreeMap<String, u64>>,
}

impl StubState {
    fn sandboxes(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, u64>> {
        self.sandboxes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }
}

/// Handle to a running stub server.
pub struct StubServer {
    addr: SocketAddr,
    state: Arc<StubState>,
    task: JoinHandle<std::io::Result<()>>,
}

impl StubServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Directory the envd side operates on.
    pub fn root(&self) -> &Path {
        &self.state.root
    }

    pub fn health_polls(&self) -> u32 {
        self.state.health_polls.load(Ordering::SeqCst)
    }

    pub fn is_live(&self, sandbox_id: &str) -> bool {
        self.state.sandboxes().contains_key(sandbox_id)
    }

    /// Timeout last requested for a live sandbox, in seconds.
    pub fn sandbox_timeout(&self, sandbox_id: &str) -> Option<u64> {
        self.state.sandboxes().get(sandbox_id).copied()
    }

    /// Serve until the server task ends.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await.context("stub server task panicked")??;
        Ok(())
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Bind and start serving in a background task.
pub async fn spawn(options: StubOptions) -> anyhow::Result<StubServer> {
    let (root, temp) = match options.root {
        Some(root) => {
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating stub root {}", root.display()))?;
            (std::fs::canonicalize(&root)?, None)
        }
        None => {
            let temp = tempfile::Builder::new().prefix("envd-stub-").tempdir()?;
            (std::fs::canonicalize(temp.path())?, Some(temp))
        }
    };

    let state = Arc::new(StubState {
        root,
        _temp: temp,
        api_key: options.api_key,
        access_token: options.access_token,
        unhealthy_polls: options.unhealthy_polls,
        health_polls: AtomicU32::new(0),
        process_error: options.process_error,
        racing_remove: options.racing_remove,
        next_id: AtomicU64::new(1),
        sandboxes: Mutex::new(BTreeMap::new()),
    });

    let listener = tokio::net::TcpListener::bind(options.addr)
        .await
        .with_context(|| format!("binding {}", options.addr))?;
    let addr = listener.local_addr()?;

    let router = build_router(Arc::clone(&state));
    let task = tokio::spawn(async move { axum::serve(listener, router).await });

    info!(%addr, root = %state.root.display(), "envd stub listening");
    Ok(StubServer { addr, state, task })
}

fn build_router(state: Arc<StubState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sandboxes", post(create_sandbox))
        .route("/sandboxes/:id", axum::routing::delete(destroy_sandbox))
        .route("/sandboxes/:id/connect", post(connect_sandbox))
        .route("/sandboxes/:id/timeout", post(set_timeout))
        .route("/process.Process/Start", post(start_process))
        .route("/filesystem.Filesystem/ListDir", post(list_dir))
        .route("/filesystem.Filesystem/Stat", post(stat))
        .route("/filesystem.Filesystem/Remove", post(remove))
        .route("/filesystem.Filesystem/MakeDir", post(make_dir))
        .route("/files", post(upload_file).get(download_file))
        .with_state(state)
}

/// Connect-style error body: `{"code": ..., "message": ...}`.
struct RpcError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl RpcError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "code": self.code, "message": self.message })),
        )
            .into_response()
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(err.to_string())
        } else {
            Self::internal(err)
        }
    }
}

type RpcResult<T> = std::result::Result<T, RpcError>;

fn check_api_key(state: &StubState, headers: &HeaderMap) -> RpcResult<()> {
    match &state.api_key {
        Some(expected) if headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) != Some(expected.as_str()) => {
            Err(RpcError::new(StatusCode::UNAUTHORIZED, "unauthenticated", "invalid API key"))
        }
        _ => Ok(()),
    }
}

fn check_access_token(state: &StubState, headers: &HeaderMap) -> RpcResult<()> {
    let presented = headers.get(ACCESS_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if presented != Some(state.access_token.as_str()) {
        return Err(RpcError::new(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "missing or invalid access token",
        ));
    }
    Ok(())
}

// Control plane

async fn health(State(state): State<Arc<StubState>>) -> StatusCode {
    let poll = state.health_polls.fetch_add(1, Ordering::SeqCst) + 1;
    if poll <= state.unhealthy_polls {
        debug!(poll, "Health probe answered as not ready");
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::NO_CONTENT
    }
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    #[serde(rename = "templateID")]
    template_id: String,
    #[serde(default)]
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct TimeoutBody {
    #[serde(default)]
    timeout: u64,
}

fn sandbox_json(state: &StubState, id: &str, template: &str) -> Value {
    json!({
        "sandboxID": id,
        "templateID": template,
        "clientID": "stub",
        "domain": "localhost",
        "envdAccessToken": state.access_token,
        "envdVersion": "0.0.0-stub",
    })
}

async fn create_sandbox(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> RpcResult<(StatusCode, Json<Value>)> {
    check_api_key(&state, &headers)?;

    let id = format!("sbx-{}", state.next_id.fetch_add(1, Ordering::SeqCst));
    state.sandboxes().insert(id.clone(), body.timeout);
    info!(sandbox_id = %id, template = %body.template_id, "Sandbox created");

    Ok((
        StatusCode::CREATED,
        Json(sandbox_json(&state, &id, &body.template_id)),
    ))
}

async fn connect_sandbox(
    State(state): State<Arc<StubState>>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<TimeoutBody>,
) -> RpcResult<Json<Value>> {
    check_api_key(&state, &headers)?;

    match state.sandboxes().get_mut(&id) {
        Some(timeout) => *timeout = body.timeout,
        None => return Err(RpcError::not_found(format!("sandbox {} not found", id))),
    }
    Ok(Json(sandbox_json(&state, &id, "base")))
}

async fn set_timeout(
    State(state): State<Arc<StubState>>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<TimeoutBody>,
) -> RpcResult<StatusCode> {
    check_api_key(&state, &headers)?;

    match state.sandboxes().get_mut(&id) {
        Some(timeout) => *timeout = body.timeout,
        None => return Err(RpcError::not_found(format!("sandbox {} not found", id))),
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn destroy_sandbox(
    State(state): State<Arc<StubState>>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
) -> RpcResult<StatusCode> {
    check_api_key(&state, &headers)?;

    if state.sandboxes().remove(&id).is_none() {
        return Err(RpcError::not_found(format!("sandbox {} not found", id)));
    }
    info!(sandbox_id = %id, "Sandbox destroyed");
    Ok(StatusCode::NO_CONTENT)
}

// Process service

#[derive(Debug, Deserialize)]
struct StartBody {
    process: ProcessBody,
}

#[derive(Debug, Deserialize)]
struct ProcessBody {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    envs: BTreeMap<String, String>,
    cwd: Option<String>,
}

fn frame(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn event(value: Value) -> Vec<u8> {
    frame(0, value.to_string().as_bytes())
}

fn first_message(body: &[u8]) -> Option<&[u8]> {
    let header = body.get(..5)?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    body.get(5..5 + len)
}

fn stream_response(frames: Vec<Vec<u8>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/connect+json")],
        frames.concat(),
    )
        .into_response()
}

async fn start_process(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    body: Bytes,
) -> RpcResult<Response> {
    check_access_token(&state, &headers)?;

    let message = first_message(&body).ok_or_else(|| {
        RpcError::new(StatusCode::BAD_REQUEST, "invalid_argument", "malformed envelope")
    })?;
    let start: StartBody = serde_json::from_slice(message)
        .map_err(|e| RpcError::new(StatusCode::BAD_REQUEST, "invalid_argument", e.to_string()))?;

    let mut frames = Vec::new();

    if let Some(error) = &state.process_error {
        frames.push(event(json!({ "event": { "start": { "pid": 1 } } })));
        frames.push(frame(
            FLAG_END_STREAM,
            json!({ "error": { "code": "internal", "message": error } })
                .to_string()
                .as_bytes(),
        ));
        return Ok(stream_response(frames));
    }

    let cwd = start
        .process
        .cwd
        .as_deref()
        .map(|cwd| state.resolve(cwd))
        .unwrap_or_else(|| state.root.clone());

    debug!(cmd = %start.process.cmd, cwd = %cwd.display(), "Starting process");

    let child = tokio::process::Command::new(&start.process.cmd)
        .args(&start.process.args)
        .envs(&start.process.envs)
        .current_dir(&cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            frames.push(frame(
                FLAG_END_STREAM,
                json!({ "error": { "code": "internal", "message": e.to_string() } })
                    .to_string()
                    .as_bytes(),
            ));
            return Ok(stream_response(frames));
        }
    };

    frames.push(event(json!({ "event": { "start": { "pid": child.id() } } })));
    let output = child.wait_with_output().await.map_err(RpcError::internal)?;

    for chunk in output.stdout.chunks(CHUNK_SIZE) {
        frames.push(event(
            json!({ "event": { "data": { "stdout": BASE64.encode(chunk) } } }),
        ));
    }
    for chunk in output.stderr.chunks(CHUNK_SIZE) {
        frames.push(event(
            json!({ "event": { "data": { "stderr": BASE64.encode(chunk) } } }),
        ));
    }

    // Zero values are omitted, as proto3 JSON does.
    let code = output.status.code().unwrap_or(-1);
    let mut end = json!({ "exited": true, "status": format!("exit status {}", code) });
    if code != 0 {
        end["exitCode"] = json!(code);
    }
    frames.push(event(json!({ "event": { "end": end } })));
    frames.push(frame(FLAG_END_STREAM, b"{}"));

    Ok(stream_response(frames))
}

// Filesystem service

#[derive(Debug, Deserialize)]
struct PathBody {
    path: String,
}

#[derive(Debug, Deserialize)]
struct ListDirBody {
    path: String,
    #[serde(default)]
    depth: u32,
}

fn entry_info(path: &Path, meta: &std::fs::Metadata) -> Value {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    let file_type = if meta.is_dir() {
        "FILE_TYPE_DIRECTORY"
    } else {
        "FILE_TYPE_FILE"
    };

    json!({
        "name": path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        "type": file_type,
        "path": path.to_string_lossy(),
        "size": meta.len(),
        "modified_time": { "seconds": modified.as_secs(), "nanos": modified.subsec_nanos() },
    })
}

fn walk(dir: &Path, depth: u32, limit: u32, out: &mut Vec<Value>) -> std::io::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let path = child.path();
        let meta = std::fs::metadata(&path)?;
        out.push(entry_info(&path, &meta));
        if meta.is_dir() && (limit == 0 || depth < limit) {
            walk(&path, depth + 1, limit, out)?;
        }
    }
    Ok(())
}

async fn list_dir(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<ListDirBody>,
) -> RpcResult<Json<Value>> {
    check_access_token(&state, &headers)?;

    let dir = state.resolve(&body.path);
    let meta = tokio::fs::metadata(&dir)
        .await
        .map_err(|_| RpcError::not_found(format!("path not found: {}", body.path)))?;
    if !meta.is_dir() {
        return Err(RpcError::new(
            StatusCode::BAD_REQUEST,
            "invalid_argument",
            format!("path is not a directory: {}", body.path),
        ));
    }

    let depth = body.depth;
    let entries = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        walk(&dir, 1, depth, &mut out).map(|_| out)
    })
    .await
    .map_err(RpcError::internal)??;

    Ok(Json(json!({ "entries": entries })))
}

async fn stat(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<PathBody>,
) -> RpcResult<Json<Value>> {
    check_access_token(&state, &headers)?;

    let path = state.resolve(&body.path);
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|_| RpcError::not_found(format!("path not found: {}", body.path)))?;
    Ok(Json(json!({ "entry": entry_info(&path, &meta) })))
}

async fn remove(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<PathBody>,
) -> RpcResult<Json<Value>> {
    check_access_token(&state, &headers)?;

    let path = state.resolve(&body.path);
    if state.racing_remove {
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await?,
            Ok(_) => tokio::fs::remove_file(&path).await?,
            Err(_) => {}
        }
    }
    let meta = tokio::fs::symlink_metadata(&path)
        .await
        .map_err(|_| RpcError::not_found(format!("path not found: {}", body.path)))?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(&path).await?;
    } else {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(Json(json!({})))
}

async fn make_dir(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<PathBody>,
) -> RpcResult<Json<Value>> {
    check_access_token(&state, &headers)?;

    let path = state.resolve(&body.path);
    if tokio::fs::metadata(&path).await.is_ok() {
        return Err(RpcError::new(
            StatusCode::CONFLICT,
            "already_exists",
            format!("path already exists: {}", body.path),
        ));
    }
    tokio::fs::create_dir_all(&path).await?;
    Ok(Json(json!({ "entry": { "name": body.path, "type": "FILE_TYPE_DIRECTORY" } })))
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: String,
}

async fn upload_file(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
    mut multipart: Multipart,
) -> RpcResult<Json<Value>> {
    check_access_token(&state, &headers)?;

    let target = state.resolve(&query.path);
    let mut written = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RpcError::new(StatusCode::BAD_REQUEST, "invalid_argument", e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| RpcError::new(StatusCode::BAD_REQUEST, "invalid_argument", e.to_string()))?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;
        written = true;
    }

    if !written {
        warn!(path = %query.path, "Upload without a file part");
        return Err(RpcError::new(
            StatusCode::BAD_REQUEST,
            "invalid_argument",
            "missing multipart field 'file'",
        ));
    }

    Ok(Json(json!([{ "name": query.path, "type": "file", "path": target.to_string_lossy() }])))
}

async fn download_file(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
) -> RpcResult<Response> {
    check_access_token(&state, &headers)?;

    let target = state.resolve(&query.path);
    let data = tokio::fs::read(&target).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        assert_eq!(frame(FLAG_END_STREAM, b"{}"), vec![2, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn test_first_message() {
        let mut body = frame(0, b"{\"a\":1}");
        body.extend(frame(0, b"{}"));
        assert_eq!(first_message(&body), Some(&b"{\"a\":1}"[..]));
        assert_eq!(first_message(&[0, 0, 0]), None);
        assert_eq!(first_message(&[0, 0, 0, 0, 9, b'x']), None);
    }

    #[test]
    fn test_walk_depth() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/b/f.txt"), "x").unwrap();

        let mut one = Vec::new();
        walk(temp.path(), 1, 1, &mut one).unwrap();
        assert_eq!(one.len(), 1);

        let mut all = Vec::new();
        walk(temp.path(), 1, 0, &mut all).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2]["name"], "f.txt");
        assert_eq!(all[2]["size"], 1);
    }
}
