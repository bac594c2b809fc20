use assist_core::config::AppConfig;
use assist_core::daemon::{DaemonStatus, ScanRequest};
use assist_core::events::CursorRegistry;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cli::api::{self, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use storage::models::ActivityKind;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceExt;

struct Harness {
    router: Router,
    state: AppState,
    scan_rx: mpsc::Receiver<ScanRequest>,
    shutdown_rx: broadcast::Receiver<()>,
}

async fn harness(name: &str) -> Harness {
    let url = format!("sqlite://file:{name}?mode=memory&cache=shared");
    let store = storage::open(&url).await.unwrap();
    let (scan_tx, scan_rx) = mpsc::channel(16);
    let (shutdown, shutdown_rx) = broadcast::channel(4);
    let state = AppState {
        store,
        config: AppConfig::default(),
        status: DaemonStatus::default(),
        cursors: CursorRegistry::new(),
        scan_tx,
        shutdown,
        started_at: storage::unix_now(),
    };
    Harness {
        router: api::router(state.clone()),
        state,
        scan_rx,
        shutdown_rx,
    }
}

async fn request(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_store_ok() {
    let h = harness("api_health").await;
    let (status, body) = request(&h.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "ok");
}

#[tokio::test]
async fn status_exposes_counters() {
    let h = harness("api_status").await;
    let (status, body) = request(&h.router, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].as_str().is_some());
    assert!(body["uptime_secs"].as_i64().unwrap() >= 0);
    assert_eq!(body["files_tracked"], 0);
    assert_eq!(body["pending_sha256"], 0);
    assert_eq!(body["pending_uploads"], 0);
    assert_eq!(body["scanner_active"], false);
}

#[tokio::test]
async fn root_registration_conflicts_return_the_existing_id() {
    let h = harness("api_roots").await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_string_lossy().into_owned();

    let (status, body) = request(
        &h.router,
        "POST",
        "/api/roots",
        Some(json!({ "path": path })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["root"]["id"].as_i64().unwrap();
    assert_eq!(body["root"]["recursive"], true);

    let (status, body) = request(
        &h.router,
        "POST",
        "/api/roots",
        Some(json!({ "path": path })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["id"].as_i64().unwrap(), id);
    assert!(body["error"].as_str().unwrap().contains("registered"));

    let (status, body) = request(&h.router, "GET", "/api/roots", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["roots"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn root_paths_are_validated() {
    let h = harness("api_root_validate").await;
    let (status, body) = request(
        &h.router,
        "POST",
        "/api/roots",
        Some(json!({ "path": "relative/path" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("absolute"));

    let (status, _) = request(
        &h.router,
        "POST",
        "/api/roots",
        Some(json!({ "path": "/definitely/not/a/real/dir" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(&h.router, "DELETE", "/api/roots/99", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scan_endpoints_dispatch_to_the_scanner() {
    let mut h = harness("api_scan").await;
    let dir = tempfile::tempdir().unwrap();
    let (_, body) = request(
        &h.router,
        "POST",
        "/api/roots",
        Some(json!({ "path": dir.path().to_string_lossy() })),
    )
    .await;
    let id = body["root"]["id"].as_i64().unwrap();

    let (status, body) = request(
        &h.router,
        "POST",
        &format!("/api/roots/{id}/scan"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "scheduled");
    let received = h.scan_rx.recv().await.unwrap();
    assert_eq!(received.root_id, Some(id));

    let (status, _) = request(&h.router, "POST", "/api/scan_all", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let received = h.scan_rx.recv().await.unwrap();
    assert_eq!(received.root_id, None);

    let (status, _) = request(&h.router, "POST", "/api/roots/424242/scan", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn exclude_crud_over_http() {
    let h = harness("api_excludes").await;
    let (status, body) = request(
        &h.router,
        "POST",
        "/api/excludes",
        Some(json!({ "pattern": "*.log" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_i64().unwrap();

    let (status, _) = request(
        &h.router,
        "POST",
        "/api/excludes",
        Some(json!({ "pattern": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = request(&h.router, "GET", "/api/excludes", None).await;
    assert_eq!(body["excludes"].as_array().unwrap().len(), 1);

    let (status, _) = request(&h.router, "DELETE", &format!("/api/excludes/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn servers_never_leak_secrets() {
    let h = harness("api_servers").await;
    let (status, body) = request(
        &h.router,
        "POST",
        "/api/servers",
        Some(json!({
            "name": "prod",
            "base_url": "https://depot.example.com",
            "username": "assist",
            "secret": "hunter2",
            "is_default": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_i64().unwrap();

    let (_, body) = request(&h.router, "GET", "/api/servers", None).await;
    let servers = body["servers"].as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["is_default"], true);
    assert!(servers[0].get("secret").is_none(), "secret must not serialize");
    assert!(servers[0].get("token").is_none());
    assert!(!body.to_string().contains("hunter2"));

    let (status, _) = request(
        &h.router,
        "POST",
        &format!("/api/servers/{id}/set_default"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&h.router, "DELETE", &format!("/api/servers/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn file_listing_paginates_over_http() {
    let h = harness("api_files").await;
    let root = h.state.store.add_root("/data", true).await.unwrap();
    for i in 0..7 {
        h.state
            .store
            .record_scanned(&storage::store::ScannedFile {
                path: format!("/data/f{i}"),
                root_id: root.id,
                size: i,
                mtime_ns: i,
                mode: 0o644,
                uid: 0,
                gid: 0,
                is_symlink: false,
                link_target: None,
            })
            .await
            .unwrap();
    }

    let (status, body) = request(&h.router, "GET", "/api/files?limit=3&offset=3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 7);
    assert_eq!(body["files"].as_array().unwrap().len(), 3);

    let (_, body) = request(&h.router, "GET", "/api/files?path_prefix=/data/f1", None).await;
    assert_eq!(body["total"], 1);

    let id = body["files"][0]["id"].as_i64().unwrap();
    let (status, body) = request(&h.router, "GET", &format!("/api/files/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["file"]["path"], "/data/f1");

    let (status, _) = request(&h.router, "GET", "/api/files/424242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_trigger_reports_the_queued_count() {
    let h = harness("api_trigger").await;
    let store = &h.state.store;
    let root = store.add_root("/data", true).await.unwrap();
    for i in 0..3 {
        let path = format!("/data/f{i}");
        store
            .record_scanned(&storage::store::ScannedFile {
                path: path.clone(),
                root_id: root.id,
                size: i,
                mtime_ns: i,
                mode: 0o644,
                uid: 0,
                gid: 0,
                is_symlink: false,
                link_target: None,
            })
            .await
            .unwrap();
        let file = store.get_file_by_path(&path).await.unwrap().unwrap();
        store
            .finish_fingerprint(file.id, None, &format!("{:064}", i), i, i, true)
            .await
            .unwrap();
    }
    // Clear the auto-enqueued entries so the trigger has work to do.
    for entry in store
        .claim(storage::models::QueueKind::PendingUpload, 10, 60)
        .await
        .unwrap()
    {
        store.complete(entry.id).await.unwrap();
    }

    let (status, body) = request(
        &h.router,
        "POST",
        "/api/uploads/trigger",
        Some(json!({ "upload_content": true, "limit": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["files_queued"], 2);
}

#[tokio::test]
async fn activity_listing_honors_cursor_and_kind() {
    let h = harness("api_activity").await;
    for i in 0..5 {
        h.state
            .store
            .append_activity(
                ActivityKind::FileDiscovered,
                Some(&format!("/data/f{i}")),
                None,
                None,
                Some(json!({ "size": i })),
            )
            .await
            .unwrap();
    }
    h.state
        .store
        .append_activity(ActivityKind::Error, None, None, Some("boom"), None)
        .await
        .unwrap();

    let (status, body) = request(&h.router, "GET", "/api/activity?since_id=2", None).await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["id"], 3);
    // details come back as parsed JSON, not a string.
    assert_eq!(events[0]["details"]["size"], 2);

    let (_, body) = request(&h.router, "GET", "/api/activity?kind=error", None).await;
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["message"], "boom");
}

#[tokio::test]
async fn sse_stream_replays_without_gaps_or_duplicates() {
    let h = harness("api_sse").await;
    let store = h.state.store.clone();
    for i in 0..3 {
        store
            .append_activity(ActivityKind::FileDiscovered, Some(&format!("/f{i}")), None, None, None)
            .await
            .unwrap();
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = h.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    async fn read_ids(addr: std::net::SocketAddr, since: i64, expect: usize) -> Vec<i64> {
        use futures::StreamExt;
        let response = reqwest::get(format!(
            "http://{addr}/api/activity/stream?since_id={since}"
        ))
        .await
        .unwrap();
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );
        let mut stream = response.bytes_stream();
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut text = String::new();
        while seen.len() < expect {
            let chunk = tokio::time::timeout_at(deadline, stream.next())
                .await
                .expect("stream timed out")
                .expect("stream ended")
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
            seen = text
                .lines()
                .filter_map(|line| line.strip_prefix("id: "))
                .filter_map(|id| id.trim().parse().ok())
                .collect();
        }
        seen
    }

    let first = read_ids(addr, 0, 3).await;
    assert_eq!(first, vec![1, 2, 3]);

    // More events arrive; reconnecting from the last seen id yields exactly
    // the new ones.
    for i in 3..6 {
        store
            .append_activity(ActivityKind::FileDiscovered, Some(&format!("/f{i}")), None, None, None)
            .await
            .unwrap();
    }
    let second = read_ids(addr, 3, 3).await;
    assert_eq!(second, vec![4, 5, 6]);
}

#[tokio::test]
async fn shutdown_endpoint_signals_the_daemon() {
    let mut h = harness("api_shutdown").await;
    let (status, body) = request(&h.router, "POST", "/api/shutdown", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopping");
    assert!(h.shutdown_rx.try_recv().is_ok());
}
