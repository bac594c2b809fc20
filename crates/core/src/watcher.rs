//! Continuous filesystem watching for registered roots.
//!
//! Platform-native notify events are debounced per path so a single editor
//! save produces one work item. A flush runs the same upsert/enqueue
//! transaction as the scanner; deletions go to the deletion queue. When the
//! platform notifier overflows, the whole root is rescanned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use storage::models::{ActivityKind, Root};
use storage::Store;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::scanner::{self, ExcludeSet};

const FLUSH_TICK: Duration = Duration::from_millis(500);

/// Watch one root until shutdown. Spawned per enabled root by the daemon.
pub async fn watch_root(
    store: Store,
    root: Root,
    debounce: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    let mode = if root.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(Path::new(&root.path), mode)?;
    info!(root = %root.path, "watching");

    // Last event time per path; a path flushes once it has been quiet for
    // the debounce window.
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    let mut tick = tokio::time::interval(FLUSH_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(root = %root.path, error = %err, "watcher event error");
                        continue;
                    }
                };
                if event.need_rescan() {
                    recover(&store, &root).await;
                    pending.clear();
                    continue;
                }
                if !is_relevant(&event) {
                    continue;
                }
                let now = Instant::now();
                for path in event.paths {
                    pending.insert(path, now);
                }
            }
            _ = tick.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let now = Instant::now();
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) >= debounce)
                    .map(|(path, _)| path.clone())
                    .collect();
                if ready.is_empty() {
                    continue;
                }
                let excludes = match ExcludeSet::from_store(&store).await {
                    Ok(excludes) => excludes,
                    Err(err) => {
                        warn!(error = %err, "cannot load exclude patterns");
                        continue;
                    }
                };
                for path in ready {
                    pending.remove(&path);
                    flush_path(&store, &root, &excludes, &path).await;
                }
            }
        }
    }

    Ok(())
}

/// Apply one debounced observation: upsert or mark deleted.
async fn flush_path(store: &Store, root: &Root, excludes: &ExcludeSet, path: &Path) {
    if let Ok(rel) = path.strip_prefix(&root.path) {
        if excludes.matches(rel) {
            return;
        }
    }

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => match scanner::stat_file(path) {
            Ok(mut scanned) => {
                scanned.root_id = root.id;
                if let Err(err) = store.record_scanned(&scanned).await {
                    warn!(path = %path.display(), error = %err, "failed to record watched file");
                } else {
                    debug!(path = %path.display(), "watch event recorded");
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot stat watched file");
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            match store.mark_deleted(&path.to_string_lossy()).await {
                Ok(Some(_)) => debug!(path = %path.display(), "deletion recorded"),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to record deletion");
                }
            }
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot stat watched path");
        }
    }
}

/// The platform dropped events; rescan the root so nothing is missed.
async fn recover(store: &Store, root: &Root) {
    warn!(root = %root.path, "notifier overflow, rescanning root");
    let excludes = match ExcludeSet::from_store(store).await {
        Ok(excludes) => excludes,
        Err(_) => ExcludeSet::default(),
    };
    if let Err(err) = scanner::scan_root(store, root, &excludes).await {
        warn!(root = %root.path, error = %err, "recovery rescan failed");
        return;
    }
    let _ = store
        .append_activity(
            ActivityKind::ScanRecovered,
            None,
            Some(root.id),
            Some(&format!("Rescanned {} after notifier overflow", root.path)),
            None,
        )
        .await;
}

fn is_relevant(event: &Event) -> bool {
    use notify::EventKind;
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::models::QueueKind;
    use storage::store::FileFilter;

    async fn test_store(name: &str) -> Store {
        let url = format!("sqlite://file:{name}?mode=memory&cache=shared");
        storage::open(&url).await.unwrap()
    }

    #[tokio::test]
    async fn flush_records_files_and_deletions() {
        let store = test_store("watch_flush").await;
        let dir = tempfile::tempdir().unwrap();
        let root_path = dir.path().to_string_lossy().into_owned();
        let added = store.add_root(&root_path, true).await.unwrap();
        let root = store.get_root(added.id).await.unwrap().unwrap();

        let file = dir.path().join("note.txt");
        std::fs::write(&file, b"hello").unwrap();
        flush_path(&store, &root, &ExcludeSet::default(), &file).await;

        let (files, _) = store.list_files(&FileFilter::default()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, "discovered");
        assert_eq!(store.queue_len(QueueKind::PendingChecksum).await.unwrap(), 1);

        std::fs::remove_file(&file).unwrap();
        flush_path(&store, &root, &ExcludeSet::default(), &file).await;
        let row = store
            .get_file_by_path(&file.to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "deleted");
        assert_eq!(store.queue_len(QueueKind::PendingDeletion).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_honors_excludes() {
        let store = test_store("watch_excl").await;
        let dir = tempfile::tempdir().unwrap();
        let root_path = dir.path().to_string_lossy().into_owned();
        let added = store.add_root(&root_path, true).await.unwrap();
        let root = store.get_root(added.id).await.unwrap().unwrap();

        let excluded = dir.path().join("debug.log");
        std::fs::write(&excluded, b"x").unwrap();
        let excludes = ExcludeSet::new(&["*.log".to_string()]);
        flush_path(&store, &root, &excludes, &excluded).await;

        let (files, _) = store.list_files(&FileFilter::default()).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn watcher_picks_up_a_created_file() {
        let store = test_store("watch_live").await;
        let dir = tempfile::tempdir().unwrap();
        let root_path = dir.path().canonicalize().unwrap();
        let added = store
            .add_root(&root_path.to_string_lossy(), true)
            .await
            .unwrap();
        let root = store.get_root(added.id).await.unwrap().unwrap();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(watch_root(
            store.clone(),
            root,
            Duration::from_millis(100),
            shutdown_tx.subscribe(),
        ));

        // Give the watcher a moment to register, then create a file.
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(root_path.join("fresh.txt"), b"fresh").unwrap();

        let mut recorded = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if store.queue_len(QueueKind::PendingChecksum).await.unwrap() == 1 {
                recorded = true;
                break;
            }
        }
        let _ = shutdown_tx.send(());
        let _ = handle.await;
        assert!(recorded, "watcher should have enqueued the new file");
    }
}
