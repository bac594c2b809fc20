//! Upload worker pool.
//!
//! Each worker claims one entry at a time, resolves the default server,
//! acquires a bearer token (cached on the server row), posts the metadata
//! record, and streams content when the server asks for it. Workers share
//! nothing but the Store; a long upload on one worker never blocks the
//! others.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use remote::{FileRecord, RemoteError, RetryClass, RetryPolicy, ServerClient};
use storage::models::{ActivityKind, FileStatus, QueueEntry, QueueKind, Server};
use storage::{unix_now, Store};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::UploaderConfig;
use crate::netinfo::HostInfo;

const IDLE_POLL: Duration = Duration::from_secs(1);
const NO_SERVER_POLL: Duration = Duration::from_secs(5);
const PROGRESS_TICK: Duration = Duration::from_millis(500);
// Tokens within this many seconds of expiry are refreshed eagerly.
const TOKEN_SLACK: i64 = 30;

/// Spawn the worker pool and wait for all workers to stop.
pub async fn run_pool(
    store: Store,
    cfg: UploaderConfig,
    host: HostInfo,
    token_ttl: i64,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let pool_size = cfg.pool_size();
    info!(workers = pool_size, "uploader pool starting");
    let mut handles = Vec::new();
    for worker_id in 0..pool_size {
        let store = store.clone();
        let cfg = cfg.clone();
        let host = host.clone();
        let shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            worker(store, cfg, host, token_ttl, worker_id, shutdown).await
        }));
    }
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "uploader worker panicked");
        }
    }
    Ok(())
}

async fn worker(
    store: Store,
    cfg: UploaderConfig,
    host: HostInfo,
    token_ttl: i64,
    worker_id: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let policy = RetryPolicy::new(
        Duration::from_millis(cfg.retry_base_delay_ms),
        Duration::from_millis(cfg.retry_max_delay_ms),
    );
    // Each worker owns its own connection to the server.
    let mut client: Option<(String, ServerClient)> = None;
    // The lease must outlive the longest allowed content upload.
    let lease_secs = cfg.content_timeout_secs as i64 + 60;

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        let server = match store.default_server().await {
            Ok(Some(server)) => server,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(NO_SERVER_POLL) => continue,
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot read default server");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(NO_SERVER_POLL) => continue,
                }
            }
        };
        let client = match &mut client {
            Some((url, existing)) if *url == server.base_url => existing,
            slot => {
                let built = ServerClient::new(
                    &server.base_url,
                    Duration::from_secs(cfg.metadata_timeout_secs),
                    Duration::from_secs(cfg.content_timeout_secs),
                );
                match built {
                    Ok(built) => &mut slot.insert((server.base_url.clone(), built)).1,
                    Err(err) => {
                        warn!(error = %err, "cannot build server client");
                        tokio::time::sleep(NO_SERVER_POLL).await;
                        continue;
                    }
                }
            }
        };

        let entries = match store.claim(QueueKind::PendingUpload, 1, lease_secs).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "upload claim failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };
        let Some(entry) = entries.into_iter().next() else {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(IDLE_POLL) => continue,
            }
        };

        debug!(worker = worker_id, entry = entry.id, "upload claimed");
        tokio::select! {
            _ = shutdown.recv() => {
                // In-flight work is abandoned; the released entry is picked
                // up again on the next start.
                store.release(entry.id).await.ok();
                break;
            }
            result = process_entry(&store, &cfg, &policy, client, &server, &host, token_ttl, &entry) => {
                if let Err(err) = result {
                    warn!(entry = entry.id, error = %err, "upload entry failed internally");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_entry(
    store: &Store,
    cfg: &UploaderConfig,
    policy: &RetryPolicy,
    client: &ServerClient,
    server: &Server,
    host: &HostInfo,
    token_ttl: i64,
    entry: &QueueEntry,
) -> anyhow::Result<()> {
    let Some(file) = store.get_file(entry.file_id).await? else {
        store.complete(entry.id).await?;
        return Ok(());
    };
    if file.status == FileStatus::Deleted.as_str() {
        store.complete(entry.id).await?;
        return Ok(());
    }
    // Only files the fingerprinter handed over (or a lease-expired upload
    // being resumed) are shippable. Anything else means a newer observation
    // restarted the pipeline for this path and the entry is stale.
    if file.status != FileStatus::ReadyForUpload.as_str()
        && file.status != FileStatus::Uploading.as_str()
    {
        debug!(path = %file.path, status = %file.status, "skipping stale upload entry");
        store.complete(entry.id).await?;
        return Ok(());
    }
    let Some(sha256) = file.sha256.clone() else {
        // Should not happen: the fingerprinter enqueues only hashed files.
        store.complete(entry.id).await?;
        return Ok(());
    };
    let path = Path::new(&file.path);
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            store
                .append_activity(
                    ActivityKind::FileMissing,
                    Some(&file.path),
                    file.root_id,
                    Some("File disappeared before upload"),
                    None,
                )
                .await?;
            store.complete(entry.id).await?;
            return Ok(());
        }
        Err(err) => {
            let delay = policy.delay(entry.attempts as u32, None);
            store
                .fail(entry.id, &err.to_string(), delay.as_secs().max(1) as i64)
                .await?;
            return Ok(());
        }
    };

    let record = FileRecord {
        filepath: file.path.clone(),
        hostname: host.hostname.clone(),
        ip_address: host.ip_address.clone(),
        sha256: sha256.clone(),
        file_size: meta.size(),
        file_mode: meta.mode(),
        file_uid: meta.uid(),
        file_gid: meta.gid(),
        file_mtime: meta.mtime() as f64 + meta.mtime_nsec() as f64 / 1e9,
        file_atime: meta.atime() as f64 + meta.atime_nsec() as f64 / 1e9,
        file_ctime: meta.ctime() as f64 + meta.ctime_nsec() as f64 / 1e9,
        is_symlink: file.is_symlink,
        link_target: file.link_target.clone(),
    };

    store.set_file_status(file.id, FileStatus::Uploading).await?;

    let mut token = match ensure_token(store, client, server, token_ttl).await {
        Ok(token) => token,
        Err(err) => return handle_failure(store, policy, entry, &file.path, file.id, err).await,
    };

    // One immediate retry after a 401: the cached token may simply have
    // outlived its server-side session.
    let put = match client.put_file(&token, &record).await {
        Ok(put) => put,
        Err(err) if err.class() == RetryClass::Auth => {
            store.evict_token(server.id).await?;
            token = match ensure_token(store, client, server, token_ttl).await {
                Ok(token) => token,
                Err(err) => {
                    return handle_failure(store, policy, entry, &file.path, file.id, err).await
                }
            };
            match client.put_file(&token, &record).await {
                Ok(put) => put,
                Err(err) => {
                    return handle_failure(store, policy, entry, &file.path, file.id, err).await
                }
            }
        }
        Err(err) => return handle_failure(store, policy, entry, &file.path, file.id, err).await,
    };

    if put.upload_required && entry.upload_content {
        let size = record.file_size;
        store
            .append_activity(
                ActivityKind::UploadStarted,
                Some(&file.path),
                file.root_id,
                None,
                Some(serde_json::json!({ "file_size": size, "sha256": sha256 })),
            )
            .await?;
        let result = stream_with_progress(
            store, cfg, client, &token, &sha256, host, path, size, &file,
        )
        .await;
        match result {
            Ok(bytes) => {
                store
                    .append_activity(
                        ActivityKind::UploadComplete,
                        Some(&file.path),
                        file.root_id,
                        None,
                        Some(serde_json::json!({ "bytes_uploaded": bytes, "sha256": sha256 })),
                    )
                    .await?;
            }
            Err(err) => {
                return handle_failure(store, policy, entry, &file.path, file.id, err).await;
            }
        }
    } else {
        store
            .append_activity(
                ActivityKind::UploadComplete,
                Some(&file.path),
                file.root_id,
                None,
                Some(serde_json::json!({
                    "sha256": sha256,
                    "content_uploaded": false,
                    "deduplicated": !put.upload_required,
                })),
            )
            .await?;
    }

    store.complete_upload(entry.id, file.id).await?;
    debug!(path = %file.path, "upload finished");
    Ok(())
}

/// Stream the content upload while emitting periodic progress events.
#[allow(clippy::too_many_arguments)]
async fn stream_with_progress(
    store: &Store,
    cfg: &UploaderConfig,
    client: &ServerClient,
    token: &str,
    sha256: &str,
    host: &HostInfo,
    path: &Path,
    size: u64,
    file: &storage::models::FileRow,
) -> Result<u64, RemoteError> {
    let sent = Arc::new(AtomicU64::new(0));
    let upload = client.upload_file(token, sha256, &host.hostname, path, size, sent.clone());
    tokio::pin!(upload);

    let step = cfg.progress_step_percent.max(1);
    let mut reported = 0u64;
    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = &mut upload => {
                result?;
                return Ok(sent.load(Ordering::Relaxed));
            }
            _ = ticker.tick() => {
                let bytes = sent.load(Ordering::Relaxed);
                let percent = if size == 0 { 100 } else { bytes * 100 / size };
                if percent >= reported + step && percent < 100 {
                    reported = percent - percent % step;
                    let _ = store
                        .append_activity(
                            ActivityKind::UploadProgress,
                            Some(&file.path),
                            file.root_id,
                            None,
                            Some(serde_json::json!({
                                "bytes_uploaded": bytes,
                                "progress_percent": reported,
                            })),
                        )
                        .await;
                }
            }
        }
    }
}

/// Acquire a valid bearer token, reusing the cached one when it has life
/// left in it.
async fn ensure_token(
    store: &Store,
    client: &ServerClient,
    server: &Server,
    token_ttl: i64,
) -> Result<String, RemoteError> {
    let fresh = store
        .default_server()
        .await
        .ok()
        .flatten()
        .filter(|s| s.id == server.id);
    let cached = fresh.as_ref().unwrap_or(server);
    if let (Some(token), Some(expiry)) = (&cached.token, cached.token_expiry) {
        if expiry > unix_now() + TOKEN_SLACK {
            return Ok(token.clone());
        }
    }
    let token = client.login(&cached.username, &cached.secret).await?;
    if let Err(err) = store
        .cache_token(server.id, &token.access_token, unix_now() + token_ttl)
        .await
    {
        warn!(error = %err, "failed to cache token");
    }
    Ok(token.access_token)
}

/// Convert a remote failure into the right queue action.
async fn handle_failure(
    store: &Store,
    policy: &RetryPolicy,
    entry: &QueueEntry,
    path: &str,
    file_id: i64,
    err: RemoteError,
) -> anyhow::Result<()> {
    match err.class() {
        RetryClass::Transient => {
            let delay = policy.delay(entry.attempts as u32, err.retry_after());
            warn!(
                path = %path,
                attempt = entry.attempts + 1,
                delay_secs = delay.as_secs(),
                error = %err,
                "transient upload failure, backing off"
            );
            store.set_file_status(file_id, FileStatus::ReadyForUpload).await?;
            store
                .fail(entry.id, &err.to_string(), delay.as_secs().max(1) as i64)
                .await?;
        }
        RetryClass::Auth => {
            warn!(path = %path, error = %err, "authentication failed, giving up on entry");
            store
                .append_activity(
                    ActivityKind::Error,
                    Some(path),
                    None,
                    Some("Authentication with the remote server failed"),
                    Some(serde_json::json!({ "error": err.to_string() })),
                )
                .await?;
            store.mark_file_failed(file_id, &err.to_string()).await?;
            store.complete(entry.id).await?;
        }
        RetryClass::Terminal => {
            warn!(path = %path, error = %err, "terminal upload failure");
            store
                .append_activity(
                    ActivityKind::UploadFailed,
                    Some(path),
                    None,
                    None,
                    Some(serde_json::json!({ "error": err.to_string() })),
                )
                .await?;
            store.mark_file_failed(file_id, &err.to_string()).await?;
            store.complete(entry.id).await?;
        }
    }
    Ok(())
}
