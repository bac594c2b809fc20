//! Background SHA-256 worker.
//!
//! A single worker is enough: the bottleneck is disk I/O on one volume.
//! Entries are claimed in batches with a lease; each file is read in fixed
//! chunks with an optional inter-chunk sleep to bound pressure. A stat is
//! taken before and after hashing so a mid-hash modification discards the
//! digest instead of shipping a torn read.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use storage::models::{ActivityKind, FileStatus, QueueEntry, QueueKind};
use storage::store::FingerprintOutcome;
use storage::Store;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::Sha256Config;

const IDLE_POLL: Duration = Duration::from_secs(1);
// Backoff used when the file changed mid-hash; the next attempt usually
// sees a stable mtime.
const TORN_READ_BACKOFF: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatSnapshot {
    size: i64,
    mtime_ns: i64,
}

fn snapshot(path: &Path) -> std::io::Result<StatSnapshot> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok(StatSnapshot {
        size: meta.size() as i64,
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
    })
}

/// Stream a file into SHA-256 with chunked reads and optional rate limiting.
/// Returns the 64-char lowercase hex digest.
pub async fn hash_file(path: &Path, chunk_size: usize, chunk_delay: Duration) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(4096)];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if !chunk_delay.is_zero() {
            tokio::time::sleep(chunk_delay).await;
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Run the fingerprint loop until shutdown.
pub async fn run(
    store: Store,
    cfg: Sha256Config,
    upload_content: bool,
    active: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        let entries = store
            .claim(QueueKind::PendingChecksum, cfg.batch_size, cfg.lease_secs)
            .await?;
        if entries.is_empty() {
            active.store(false, Ordering::Relaxed);
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(IDLE_POLL) => continue,
            }
        }
        active.store(true, Ordering::Relaxed);
        let mut remaining = entries.into_iter();
        while let Some(entry) = remaining.next() {
            if shutdown.try_recv().is_ok() {
                // Give unprocessed claims back instead of waiting out the lease.
                store.release(entry.id).await.ok();
                for rest in remaining {
                    store.release(rest.id).await.ok();
                }
                active.store(false, Ordering::Relaxed);
                return Ok(());
            }
            if let Err(err) = process_entry(&store, &cfg, upload_content, &entry).await {
                warn!(entry = entry.id, error = %err, "fingerprint entry failed");
            }
        }
    }
    active.store(false, Ordering::Relaxed);
    Ok(())
}

async fn process_entry(
    store: &Store,
    cfg: &Sha256Config,
    upload_content: bool,
    entry: &QueueEntry,
) -> anyhow::Result<()> {
    let Some(file) = store.get_file(entry.file_id).await? else {
        store.complete(entry.id).await?;
        return Ok(());
    };
    let path = Path::new(&file.path);

    let before = match snapshot(path) {
        Ok(stat) => stat,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            store
                .append_activity(
                    ActivityKind::FileMissing,
                    Some(&file.path),
                    file.root_id,
                    Some("File disappeared before fingerprinting"),
                    None,
                )
                .await?;
            store.set_file_error(file.id, "file missing").await?;
            store.complete(entry.id).await?;
            return Ok(());
        }
        Err(err) => {
            return retry_or_fail(store, cfg, entry, &file.path, file.id, &err.to_string()).await;
        }
    };

    store.set_file_status(file.id, FileStatus::Hashing).await?;
    let delay = Duration::from_millis(cfg.chunk_delay_ms);
    let sha256 = match hash_file(path, cfg.chunk_size, delay).await {
        Ok(sha256) => sha256,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            store
                .append_activity(
                    ActivityKind::FileMissing,
                    Some(&file.path),
                    file.root_id,
                    Some("File disappeared during fingerprinting"),
                    None,
                )
                .await?;
            store.set_file_error(file.id, "file missing").await?;
            store.complete(entry.id).await?;
            return Ok(());
        }
        Err(err) => {
            return retry_or_fail(store, cfg, entry, &file.path, file.id, &err.to_string()).await;
        }
    };

    // A write raced the read: the digest may not correspond to any state
    // the file ever had. Leave the entry for another pass.
    let after = snapshot(path).unwrap_or(before);
    if after != before {
        debug!(path = %file.path, "file changed during hashing, retrying");
        store.set_file_status(file.id, FileStatus::Discovered).await?;
        store
            .fail(entry.id, "changed during hashing", TORN_READ_BACKOFF)
            .await?;
        return Ok(());
    }

    let outcome = store
        .finish_fingerprint(
            file.id,
            Some(entry.id),
            &sha256,
            before.size,
            before.mtime_ns,
            upload_content,
        )
        .await?;
    match outcome {
        FingerprintOutcome::Unchanged => {
            store
                .append_activity(
                    ActivityKind::FingerprintUnchanged,
                    Some(&file.path),
                    file.root_id,
                    None,
                    Some(serde_json::json!({ "sha256": sha256 })),
                )
                .await?;
        }
        FingerprintOutcome::Superseded => {
            debug!(path = %file.path, "observation raced the hash, entry requeued");
            return Ok(());
        }
        FingerprintOutcome::NeedsUpload => {}
    }
    debug!(path = %file.path, sha256 = %sha256, "fingerprinted");
    Ok(())
}

/// Transient read error: back off exponentially; after max attempts the
/// entry is dropped and the file marked failed (a rescan re-creates it).
async fn retry_or_fail(
    store: &Store,
    cfg: &Sha256Config,
    entry: &QueueEntry,
    path: &str,
    file_id: i64,
    error: &str,
) -> anyhow::Result<()> {
    let attempt = entry.attempts + 1;
    if attempt >= cfg.max_attempts {
        warn!(path = %path, error = %error, "fingerprint failed permanently");
        store.mark_file_failed(file_id, error).await?;
        store
            .append_activity(
                ActivityKind::FingerprintFailed,
                Some(path),
                None,
                Some(error),
                Some(serde_json::json!({ "attempts": attempt })),
            )
            .await?;
        store.complete(entry.id).await?;
    } else {
        let backoff = (1i64 << attempt.min(10)).min(300);
        warn!(path = %path, error = %error, attempt, backoff, "fingerprint read error");
        store.fail(entry.id, error, backoff).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::store::FileFilter;

    const EMPTY_SHA256: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    async fn test_store(name: &str) -> Store {
        let url = format!("sqlite://file:{name}?mode=memory&cache=shared");
        storage::open(&url).await.unwrap()
    }

    async fn seed_file(store: &Store, dir: &Path, name: &str, contents: &[u8]) -> i64 {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        let root = store.add_root(&dir.to_string_lossy(), true).await.unwrap();
        let scanned = crate::scanner::stat_file(&path).unwrap();
        let scanned = storage::store::ScannedFile {
            root_id: root.id,
            ..scanned
        };
        store.record_scanned(&scanned).await.unwrap();
        store
            .get_file_by_path(&path.to_string_lossy())
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn hash_file_matches_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        let digest = hash_file(&empty, 1024, Duration::ZERO).await.unwrap();
        assert_eq!(digest, EMPTY_SHA256);

        let abc = dir.path().join("abc");
        std::fs::write(&abc, b"abc").unwrap();
        // Chunk size smaller than the file exercises the streaming path.
        let digest = hash_file(&abc, 4096, Duration::ZERO).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[tokio::test]
    async fn entry_moves_file_to_ready_for_upload() {
        let store = test_store("fp_ready").await;
        let dir = tempfile::tempdir().unwrap();
        let file_id = seed_file(&store, dir.path(), "a.txt", b"hello").await;

        let entries = store.claim(QueueKind::PendingChecksum, 10, 60).await.unwrap();
        process_entry(&store, &Sha256Config::default(), true, &entries[0])
            .await
            .unwrap();

        let row = store.get_file(file_id).await.unwrap().unwrap();
        assert_eq!(row.status, "ready_for_upload");
        let sha = row.sha256.unwrap();
        assert_eq!(sha.len(), 64);
        assert_eq!(store.queue_len(QueueKind::PendingChecksum).await.unwrap(), 0);
        assert_eq!(store.queue_len(QueueKind::PendingUpload).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unchanged_content_short_circuits() {
        let store = test_store("fp_unchanged").await;
        let dir = tempfile::tempdir().unwrap();
        let file_id = seed_file(&store, dir.path(), "a.txt", b"stable").await;
        let path = dir.path().join("a.txt");

        let entries = store.claim(QueueKind::PendingChecksum, 10, 60).await.unwrap();
        process_entry(&store, &Sha256Config::default(), true, &entries[0])
            .await
            .unwrap();
        for entry in store.claim(QueueKind::PendingUpload, 10, 60).await.unwrap() {
            store.complete(entry.id).await.unwrap();
        }

        // Touch the mtime without changing content, rescan, re-fingerprint.
        std::fs::write(&path, b"stable").unwrap();
        let scanned = crate::scanner::stat_file(&path).unwrap();
        let row = store.get_file(file_id).await.unwrap().unwrap();
        let scanned = storage::store::ScannedFile {
            root_id: row.root_id.unwrap(),
            mtime_ns: row.mtime_ns + 1_000_000_000,
            ..scanned
        };
        store.record_scanned(&scanned).await.unwrap();

        let entries = store.claim(QueueKind::PendingChecksum, 10, 60).await.unwrap();
        assert_eq!(entries.len(), 1);
        process_entry(&store, &Sha256Config::default(), true, &entries[0])
            .await
            .unwrap();

        let row = store.get_file(file_id).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(store.queue_len(QueueKind::PendingUpload).await.unwrap(), 0);
        let events = store.read_activity(0, 100, Some("fingerprint_unchanged")).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_completes_the_entry() {
        let store = test_store("fp_missing").await;
        let dir = tempfile::tempdir().unwrap();
        seed_file(&store, dir.path(), "gone.txt", b"bye").await;
        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();

        let entries = store.claim(QueueKind::PendingChecksum, 10, 60).await.unwrap();
        process_entry(&store, &Sha256Config::default(), true, &entries[0])
            .await
            .unwrap();

        assert_eq!(store.queue_len(QueueKind::PendingChecksum).await.unwrap(), 0);
        let events = store.read_activity(0, 100, Some("file_missing")).await.unwrap();
        assert_eq!(events.len(), 1);
        let (files, _) = store.list_files(&FileFilter::default()).await.unwrap();
        assert_eq!(files[0].last_error.as_deref(), Some("file missing"));
    }

    #[tokio::test]
    async fn zero_byte_files_get_the_canonical_empty_hash() {
        let store = test_store("fp_zero").await;
        let dir = tempfile::tempdir().unwrap();
        let file_id = seed_file(&store, dir.path(), "empty.bin", b"").await;

        let entries = store.claim(QueueKind::PendingChecksum, 10, 60).await.unwrap();
        process_entry(&store, &Sha256Config::default(), true, &entries[0])
            .await
            .unwrap();

        let row = store.get_file(file_id).await.unwrap().unwrap();
        assert_eq!(row.sha256.as_deref(), Some(EMPTY_SHA256));
        // Zero-byte files are still reported to the server.
        assert_eq!(row.status, "ready_for_upload");
        assert_eq!(store.queue_len(QueueKind::PendingUpload).await.unwrap(), 1);
    }
}
