//! HTTP control plane.
//!
//! JSON over loopback for the GUI and CLI: roots, excludes, servers, file
//! listings, upload triggers, and the activity feed (poll + SSE). Long
//! operations are dispatched to the daemon's workers and reported through
//! activity events; handlers only touch the Store.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use assist_core::config::AppConfig;
use assist_core::daemon::{DaemonStatus, ScanRequest};
use assist_core::events::{CursorGuard, CursorRegistry};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use storage::models::ActivityRow;
use storage::store::FileFilter;
use storage::{unix_now, Store};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

const STREAM_BATCH: i64 = 100;
const STREAM_POLL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: AppConfig,
    pub status: DaemonStatus,
    pub cursors: CursorRegistry,
    pub scan_tx: mpsc::Sender<ScanRequest>,
    pub shutdown: broadcast::Sender<()>,
    pub started_at: i64,
}

/// Stable error shape for every handler: `{"error": "..."}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/api/roots", get(list_roots).post(create_root))
        .route("/api/roots/{id}", axum::routing::delete(delete_root))
        .route("/api/roots/{id}/scan", post(scan_root))
        .route("/api/scan_all", post(scan_all))
        .route("/api/excludes", get(list_excludes).post(create_exclude))
        .route("/api/excludes/{id}", axum::routing::delete(delete_exclude))
        .route("/api/servers", get(list_servers).post(create_server))
        .route("/api/servers/{id}", axum::routing::delete(delete_server))
        .route("/api/servers/{id}/set_default", post(set_default_server))
        .route("/api/files", get(list_files))
        .route("/api/files/{id}", get(get_file))
        .route("/api/uploads/trigger", post(trigger_uploads))
        .route("/api/activity", get(list_activity))
        .route("/api/activity/stream", get(stream_activity))
        .route("/api/shutdown", post(shutdown))
        .with_state(state)
}

/// Bind the control plane and serve it until shutdown fires.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let mut shutdown_rx = state.shutdown.subscribe();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "control plane listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}

// ── Health & status ────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "store": "ok" })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "store": "error", "error": err.to_string() })),
        ),
    }
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.store.stats().await?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": unix_now() - state.started_at,
        "scanner_active": state.status.scanner_active.load(std::sync::atomic::Ordering::Relaxed),
        "fingerprinter_active": state.status.fingerprinter_active.load(std::sync::atomic::Ordering::Relaxed),
        "files_tracked": stats.files_tracked,
        "files_by_status": stats.by_status,
        "pending_sha256": stats.queues.get("pending_checksum").copied().unwrap_or(0),
        "pending_uploads": stats.queues.get("pending_upload").copied().unwrap_or(0),
        "pending_deletions": stats.queues.get("pending_deletion").copied().unwrap_or(0),
    })))
}

// ── Roots ──────────────────────────────────────────────────────────────

async fn list_roots(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "roots": state.store.list_roots().await? })))
}

#[derive(Deserialize)]
struct CreateRoot {
    path: String,
    #[serde(default = "default_true")]
    recursive: bool,
}

fn default_true() -> bool {
    true
}

async fn create_root(
    State(state): State<AppState>,
    Json(body): Json<CreateRoot>,
) -> ApiResult<impl IntoResponse> {
    let path = Path::new(&body.path);
    if !path.is_absolute() {
        return Err(ApiError::bad_request("path must be absolute"));
    }
    if !path.is_dir() {
        return Err(ApiError::bad_request("path is not a directory"));
    }
    let added = state.store.add_root(&body.path, body.recursive).await?;
    if !added.created {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "error": "path already registered", "id": added.id })),
        ));
    }
    let root = state.store.get_root(added.id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "root": root }))))
}

async fn delete_root(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_root(id).await? {
        return Err(ApiError::not_found("root"));
    }
    Ok(Json(json!({ "deleted": true })))
}

async fn scan_root(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> ApiResult<Json<Value>> {
    if state.store.get_root(id).await?.is_none() {
        return Err(ApiError::not_found("root"));
    }
    state
        .scan_tx
        .send(ScanRequest { root_id: Some(id) })
        .await
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "scanner is not running"))?;
    Ok(Json(json!({ "status": "scheduled", "root_id": id })))
}

async fn scan_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state
        .scan_tx
        .send(ScanRequest { root_id: None })
        .await
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "scanner is not running"))?;
    Ok(Json(json!({ "status": "scheduled" })))
}

// ── Excludes ───────────────────────────────────────────────────────────

async fn list_excludes(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "excludes": state.store.list_excludes().await? })))
}

#[derive(Deserialize)]
struct CreateExclude {
    pattern: String,
}

async fn create_exclude(
    State(state): State<AppState>,
    Json(body): Json<CreateExclude>,
) -> ApiResult<impl IntoResponse> {
    if body.pattern.trim().is_empty() {
        return Err(ApiError::bad_request("pattern must not be empty"));
    }
    let id = state.store.add_exclude(&body.pattern).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": id, "pattern": body.pattern })),
    ))
}

async fn delete_exclude(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_exclude(id).await? {
        return Err(ApiError::not_found("exclude"));
    }
    Ok(Json(json!({ "deleted": true })))
}

// ── Servers ────────────────────────────────────────────────────────────

async fn list_servers(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "servers": state.store.list_servers().await? })))
}

#[derive(Deserialize)]
struct CreateServer {
    name: String,
    base_url: String,
    username: String,
    secret: String,
    #[serde(default)]
    is_default: bool,
}

async fn create_server(
    State(state): State<AppState>,
    Json(body): Json<CreateServer>,
) -> ApiResult<impl IntoResponse> {
    if body.base_url.trim().is_empty() {
        return Err(ApiError::bad_request("base_url must not be empty"));
    }
    let id = state
        .store
        .add_server(
            &body.name,
            &body.base_url,
            &body.username,
            &body.secret,
            body.is_default,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn delete_server(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_server(id).await? {
        return Err(ApiError::not_found("server"));
    }
    Ok(Json(json!({ "deleted": true })))
}

async fn set_default_server(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> ApiResult<Json<Value>> {
    if !state.store.set_default_server(id).await? {
        return Err(ApiError::not_found("server"));
    }
    Ok(Json(json!({ "default": id })))
}

// ── Files ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FilesQuery {
    path_prefix: Option<String>,
    sha256: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);
    let filter = FileFilter {
        path_prefix: query.path_prefix,
        sha256: query.sha256,
        limit,
        offset,
    };
    let (files, total) = state.store.list_files(&filter).await?;
    Ok(Json(json!({
        "files": files,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

async fn get_file(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> ApiResult<Json<Value>> {
    match state.store.get_file(id).await? {
        Some(file) => Ok(Json(json!({ "file": file }))),
        None => Err(ApiError::not_found("file")),
    }
}

// ── Uploads ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TriggerUploads {
    upload_content: Option<bool>,
    path_prefix: Option<String>,
    limit: Option<i64>,
}

async fn trigger_uploads(
    State(state): State<AppState>,
    Json(body): Json<TriggerUploads>,
) -> ApiResult<Json<Value>> {
    let upload_content = body
        .upload_content
        .unwrap_or(state.config.uploader.upload_content);
    let queued = state
        .store
        .enqueue_ready_uploads(
            body.path_prefix.as_deref(),
            body.limit.unwrap_or(0),
            upload_content,
        )
        .await?;
    Ok(Json(json!({ "files_queued": queued })))
}

// ── Activity ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ActivityQuery {
    limit: Option<i64>,
    since_id: Option<i64>,
    kind: Option<String>,
}

fn event_json(row: &ActivityRow) -> Value {
    json!({
        "id": row.id,
        "created_at": row.created_at,
        "kind": row.kind,
        "file_path": row.file_path,
        "root_id": row.root_id,
        "message": row.message,
        "details": row
            .details
            .as_deref()
            .and_then(|d| serde_json::from_str::<Value>(d).ok()),
    })
}

async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .store
        .read_activity(
            query.since_id.unwrap_or(0),
            query.limit.unwrap_or(100).clamp(1, 1000),
            query.kind.as_deref(),
        )
        .await?;
    let events: Vec<Value> = rows.iter().map(event_json).collect();
    Ok(Json(json!({ "events": events })))
}

#[derive(Deserialize)]
struct StreamQuery {
    since_id: Option<i64>,
}

/// Server-sent events from a cursor. The stream is a plain cursor read
/// over the activity table, so reconnecting with the last seen id never
/// drops or duplicates events.
async fn stream_activity(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let since = query.since_id.unwrap_or(0);
    let guard = state.cursors.register(since);
    let store = state.store.clone();

    struct StreamState {
        store: Store,
        guard: CursorGuard,
        cursor: i64,
        buffer: VecDeque<ActivityRow>,
    }

    let stream = futures::stream::unfold(
        StreamState {
            store,
            guard,
            cursor: since,
            buffer: VecDeque::new(),
        },
        |mut st| async move {
            loop {
                if let Some(row) = st.buffer.pop_front() {
                    st.cursor = row.id;
                    st.guard.advance(row.id);
                    let event = Event::default()
                        .id(row.id.to_string())
                        .event(row.kind.clone())
                        .data(event_json(&row).to_string());
                    return Some((Ok::<_, Infallible>(event), st));
                }
                match st.store.read_activity(st.cursor, STREAM_BATCH, None).await {
                    Ok(rows) if !rows.is_empty() => {
                        st.buffer.extend(rows);
                    }
                    Ok(_) => tokio::time::sleep(STREAM_POLL).await,
                    Err(_) => tokio::time::sleep(STREAM_POLL).await,
                }
            }
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Shutdown ───────────────────────────────────────────────────────────

async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("shutdown requested over the control plane");
    let _ = state.shutdown.send(());
    Json(json!({ "status": "stopping" }))
}
