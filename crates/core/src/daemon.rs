//! Daemon runtime: wires the workers together and runs them to shutdown.
//!
//! Workers are long-running tasks started at boot, each owning one queue
//! kind. They coordinate only through Store transactions and observe a
//! shared broadcast shutdown signal at every suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use storage::models::{ActivityKind, QueueKind};
use storage::Store;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::events::CursorRegistry;
use crate::netinfo::HostInfo;
use crate::scanner::{self, ExcludeSet};
use crate::{fingerprint, uploader, watcher};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const WATCH_REFRESH: Duration = Duration::from_secs(30);
const DRAIN_IDLE: Duration = Duration::from_secs(1);

/// A scan request from the control plane (or the boot sequence).
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest {
    /// None means every enabled root.
    pub root_id: Option<i64>,
}

/// Live worker state surfaced by /status.
#[derive(Clone, Default)]
pub struct DaemonStatus {
    pub scanner_active: Arc<AtomicBool>,
    pub fingerprinter_active: Arc<AtomicBool>,
}

/// Run every worker until the shutdown signal fires.
pub async fn run(
    store: Store,
    config: AppConfig,
    cursors: CursorRegistry,
    status: DaemonStatus,
    scan_rx: mpsc::Receiver<ScanRequest>,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    bootstrap_remote_server(&store, &config).await?;
    let host = HostInfo::detect();
    let token_ttl = config
        .remote_server
        .as_ref()
        .map(|r| r.token_ttl_secs)
        .unwrap_or(1800);

    let scan_handle = {
        let store = store.clone();
        let status = status.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = scan_task(store, status, scan_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watch_handle = {
        let store = store.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = watch_supervisor(store, config, shutdown.clone()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let fingerprint_handle = {
        let store = store.clone();
        let cfg = config.sha256.clone();
        let upload_content = config.uploader.upload_content;
        let active = status.fingerprinter_active.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result =
                fingerprint::run(store, cfg, upload_content, active, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let upload_handle = {
        let store = store.clone();
        let cfg = config.uploader.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = uploader::run_pool(store, cfg, host, token_ttl, shutdown.clone()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let drain_handle = {
        let store = store.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = deletion_drain(store, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let prune_handle = {
        let store = store.clone();
        let cfg = config.activity.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = activity_pruner(store, cfg, cursors, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let (scan, watch, fingerprint, upload, drain, prune) = tokio::join!(
        scan_handle,
        watch_handle,
        fingerprint_handle,
        upload_handle,
        drain_handle,
        prune_handle
    );
    for (name, result) in [
        ("scanner", scan),
        ("watcher", watch),
        ("fingerprinter", fingerprint),
        ("uploader", upload),
        ("deletion_drain", drain),
        ("activity_pruner", prune),
    ] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(task = name, error = %err, "worker exited with error"),
            Err(err) => warn!(task = name, error = %err, "worker join failure"),
        }
    }
    info!("daemon workers stopped");
    Ok(())
}

/// Register the configured remote server once, on first boot.
async fn bootstrap_remote_server(store: &Store, config: &AppConfig) -> anyhow::Result<()> {
    let Some(remote) = &config.remote_server else {
        return Ok(());
    };
    if !store.list_servers().await?.is_empty() {
        return Ok(());
    }
    let id = store
        .add_server(
            &remote.name,
            &remote.url,
            &remote.username,
            &remote.password,
            true,
        )
        .await?;
    info!(server = %remote.url, id, "registered default server from config");
    Ok(())
}

/// Process scan requests sequentially, starting with a full scan at boot.
async fn scan_task(
    store: Store,
    status: DaemonStatus,
    mut scan_rx: mpsc::Receiver<ScanRequest>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    run_scan(&store, &status, ScanRequest { root_id: None }).await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            request = scan_rx.recv() => {
                let Some(request) = request else { break };
                run_scan(&store, &status, request).await;
            }
        }
    }
    Ok(())
}

async fn run_scan(store: &Store, status: &DaemonStatus, request: ScanRequest) {
    status.scanner_active.store(true, Ordering::Relaxed);
    let result = match request.root_id {
        None => scanner::scan_all(store).await.map(|_| ()),
        Some(root_id) => match store.get_root(root_id).await {
            Ok(Some(root)) => match ExcludeSet::from_store(store).await {
                Ok(excludes) => scanner::scan_root(store, &root, &excludes)
                    .await
                    .map(|_| ()),
                Err(err) => Err(err),
            },
            Ok(None) => {
                warn!(root_id, "scan requested for unknown root");
                Ok(())
            }
            Err(err) => Err(err),
        },
    };
    if let Err(err) = result {
        warn!(error = %err, "scan failed");
        let _ = store
            .append_activity(
                ActivityKind::Error,
                None,
                request.root_id,
                Some(&format!("Scan failed: {err}")),
                None,
            )
            .await;
    }
    status.scanner_active.store(false, Ordering::Relaxed);
}

/// Keep one watcher task per enabled root, following root table changes.
async fn watch_supervisor(
    store: Store,
    config: AppConfig,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    if !config.watcher.enabled {
        info!("watcher disabled by config");
        let mut rx = shutdown.subscribe();
        let _ = rx.recv().await;
        return Ok(());
    }
    let debounce = Duration::from_millis(config.watcher.debounce_ms);
    let mut watchers: HashMap<i64, JoinHandle<()>> = HashMap::new();
    let mut rx = shutdown.subscribe();
    let mut tick = tokio::time::interval(WATCH_REFRESH);

    loop {
        tokio::select! {
            _ = rx.recv() => break,
            _ = tick.tick() => {
                let roots = match store.enabled_roots().await {
                    Ok(roots) => roots,
                    Err(err) => {
                        warn!(error = %err, "cannot list roots for watching");
                        continue;
                    }
                };
                let wanted: HashMap<i64, _> = roots.into_iter().map(|r| (r.id, r)).collect();
                watchers.retain(|id, handle| {
                    if wanted.contains_key(id) && !handle.is_finished() {
                        true
                    } else {
                        handle.abort();
                        false
                    }
                });
                for (id, root) in wanted {
                    if watchers.contains_key(&id) {
                        continue;
                    }
                    let store = store.clone();
                    let shutdown_rx = shutdown.subscribe();
                    let path = root.path.clone();
                    let handle = tokio::spawn(async move {
                        if let Err(err) = watcher::watch_root(store, root, debounce, shutdown_rx).await {
                            warn!(root = %path, error = %err, "watcher stopped");
                        }
                    });
                    watchers.insert(id, handle);
                }
            }
        }
    }

    for (_, handle) in watchers {
        handle.abort();
    }
    Ok(())
}

/// The server has no delete endpoint; deletions drain into the activity
/// log only.
async fn deletion_drain(store: Store, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        let entries = store.claim(QueueKind::PendingDeletion, 16, 60).await?;
        if entries.is_empty() {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(DRAIN_IDLE) => continue,
            }
        }
        for entry in entries {
            if let Some(file) = store.get_file(entry.file_id).await? {
                store
                    .append_activity(
                        ActivityKind::FileDeleted,
                        Some(&file.path),
                        file.root_id,
                        None,
                        None,
                    )
                    .await?;
            }
            store.complete(entry.id).await?;
        }
    }
    Ok(())
}

async fn activity_pruner(
    store: Store,
    cfg: crate::config::ActivityConfig,
    cursors: CursorRegistry,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(PRUNE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(cfg.retention_days);
                match store.prune_activity(cutoff, cfg.max_events, cursors.floor()).await {
                    Ok(0) => {}
                    Ok(pruned) => info!(pruned, "pruned activity events"),
                    Err(err) => warn!(error = %err, "activity pruning failed"),
                }
            }
        }
    }
    Ok(())
}
