use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use remote::{FileRecord, RemoteError, RetryClass, ServerClient};

#[derive(Default)]
struct FakeServer {
    logins: AtomicUsize,
    put_files: AtomicUsize,
    uploads: AtomicUsize,
    upload_bytes: AtomicU64,
    fail_put_with: AtomicUsize,
}

async fn login(State(state): State<Arc<FakeServer>>, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    state.logins.fetch_add(1, Ordering::SeqCst);
    if body["password"] == "wrong" {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"detail": "bad credentials"})))
            .into_response();
    }
    Json(serde_json::json!({ "access_token": "tok-1", "token_type": "bearer" })).into_response()
}

async fn put_file(
    State(state): State<Arc<FakeServer>>,
    headers: HeaderMap,
    Json(record): Json<FileRecord>,
) -> impl IntoResponse {
    state.put_files.fetch_add(1, Ordering::SeqCst);
    let fail = state.fail_put_with.swap(0, Ordering::SeqCst);
    if fail != 0 {
        let mut response = (
            StatusCode::from_u16(fail as u16).unwrap(),
            Json(serde_json::json!({"detail": "induced"})),
        )
            .into_response();
        if fail == 429 {
            response
                .headers_mut()
                .insert("retry-after", "7".parse().unwrap());
        }
        return response;
    }
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer tok-1") {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"detail": "no token"})))
            .into_response();
    }
    // Dedup: content named after the empty hash is already present.
    let known = record.sha256.starts_with("e3b0c442");
    Json(serde_json::json!({
        "upload_required": !known,
        "upload_url": if known { None } else { Some(format!("/upload_file/{}", record.sha256)) },
    }))
    .into_response()
}

async fn upload_file(
    State(state): State<Arc<FakeServer>>,
    Path(sha256): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    state.uploads.fetch_add(1, Ordering::SeqCst);
    state
        .upload_bytes
        .fetch_add(body.len() as u64, Ordering::SeqCst);
    if sha256.len() != 64 {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"detail": "bad sha"})))
            .into_response();
    }
    StatusCode::OK.into_response()
}

async fn spawn_server(state: Arc<FakeServer>) -> SocketAddr {
    let app = Router::new()
        .route("/api/login", post(login))
        .route("/put_file", post(put_file))
        .route("/upload_file/{sha256}", post(upload_file))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr) -> ServerClient {
    ServerClient::new(
        &format!("http://{addr}"),
        Duration::from_secs(5),
        Duration::from_secs(30),
    )
    .unwrap()
}

fn record(sha256: &str) -> FileRecord {
    FileRecord {
        filepath: "/data/a.txt".into(),
        hostname: "host01".into(),
        ip_address: "127.0.0.1".into(),
        sha256: sha256.into(),
        file_size: 5,
        file_mode: 0o100644,
        file_uid: 1000,
        file_gid: 1000,
        file_mtime: 1700000000.0,
        file_atime: 1700000000.0,
        file_ctime: 1700000000.0,
        is_symlink: false,
        link_target: None,
    }
}

#[tokio::test]
async fn login_and_put_file_roundtrip() {
    let state = Arc::new(FakeServer::default());
    let addr = spawn_server(state.clone()).await;
    let client = client(addr);

    let token = client.login("assist", "pw").await.unwrap();
    assert_eq!(token.access_token, "tok-1");
    assert_eq!(token.token_type, "bearer");

    let response = client
        .put_file(&token.access_token, &record(&"a".repeat(64)))
        .await
        .unwrap();
    assert!(response.upload_required);
    assert!(response.upload_url.is_some());
    assert_eq!(state.put_files.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deduplicated_content_skips_upload() {
    let state = Arc::new(FakeServer::default());
    let addr = spawn_server(state).await;
    let client = client(addr);
    let token = client.login("assist", "pw").await.unwrap();

    let empty_sha = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    let response = client
        .put_file(&token.access_token, &record(empty_sha))
        .await
        .unwrap();
    assert!(!response.upload_required);
    assert!(response.upload_url.is_none());
}

#[tokio::test]
async fn bad_credentials_classify_as_auth() {
    let state = Arc::new(FakeServer::default());
    let addr = spawn_server(state).await;
    let client = client(addr);

    let err = client.login("assist", "wrong").await.unwrap_err();
    assert_eq!(err.class(), RetryClass::Auth);
    match err {
        RemoteError::Status { status, body, .. } => {
            assert_eq!(status, 401);
            assert!(body.contains("bad credentials"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn retry_after_is_surfaced_on_429() {
    let state = Arc::new(FakeServer::default());
    state.fail_put_with.store(429, Ordering::SeqCst);
    let addr = spawn_server(state).await;
    let client = client(addr);
    let token = client.login("assist", "pw").await.unwrap();

    let err = client
        .put_file(&token.access_token, &record(&"b".repeat(64)))
        .await
        .unwrap_err();
    assert_eq!(err.class(), RetryClass::Transient);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn server_errors_classify_as_transient() {
    let state = Arc::new(FakeServer::default());
    state.fail_put_with.store(503, Ordering::SeqCst);
    let addr = spawn_server(state).await;
    let client = client(addr);
    let token = client.login("assist", "pw").await.unwrap();

    let err = client
        .put_file(&token.access_token, &record(&"c".repeat(64)))
        .await
        .unwrap_err();
    assert_eq!(err.class(), RetryClass::Transient);
}

#[tokio::test]
async fn upload_streams_and_counts_bytes() {
    let state = Arc::new(FakeServer::default());
    let addr = spawn_server(state.clone()).await;
    let client = client(addr);
    let token = client.login("assist", "pw").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let contents = vec![0xabu8; 256 * 1024];
    std::fs::write(&path, &contents).unwrap();

    let sent = Arc::new(AtomicU64::new(0));
    client
        .upload_file(
            &token.access_token,
            &"d".repeat(64),
            "host01",
            &path,
            contents.len() as u64,
            sent.clone(),
        )
        .await
        .unwrap();

    assert_eq!(state.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(sent.load(Ordering::SeqCst), contents.len() as u64);
    // The multipart envelope adds framing on top of the payload.
    assert!(state.upload_bytes.load(Ordering::SeqCst) > contents.len() as u64);
}

#[tokio::test]
async fn rejected_upload_is_terminal() {
    let state = Arc::new(FakeServer::default());
    let addr = spawn_server(state).await;
    let client = client(addr);
    let token = client.login("assist", "pw").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x");
    std::fs::write(&path, b"x").unwrap();

    let err = client
        .upload_file(&token.access_token, "short-sha", "host01", &path, 1, Arc::new(AtomicU64::new(0)))
        .await
        .unwrap_err();
    assert_eq!(err.class(), RetryClass::Terminal);
}
