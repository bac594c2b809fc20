//! The Store handle: every persistent operation of the daemon.
//!
//! Mutations that span tables (file upsert + enqueue + activity) run in a
//! single transaction so a crash can never leave a file row without its
//! queue entry or vice versa.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::{QueryBuilder, Row, SqlitePool};

use crate::models::{
    ActivityKind, Exclude, FileRow, FileStatus, QueueKind, Root, Server,
};
use crate::unix_now;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Result of registering a root path.
#[derive(Debug, Clone, Copy)]
pub struct AddRoot {
    pub id: i64,
    pub created: bool,
}

/// What a scan observation did to the file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    New,
    Changed,
    Unchanged,
}

/// Outcome of recording a finished fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintOutcome {
    Unchanged,
    NeedsUpload,
    /// A newer observation restarted the pipeline while the hash ran; the
    /// digest was discarded.
    Superseded,
}

/// Stat data the scanner observed for one file.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: String,
    pub root_id: i64,
    pub size: i64,
    pub mtime_ns: i64,
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
    pub is_symlink: bool,
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub path_prefix: Option<String>,
    pub sha256: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub files_tracked: i64,
    pub by_status: HashMap<String, i64>,
    pub queues: HashMap<String, i64>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap liveness probe used by /health.
    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ── Roots ──────────────────────────────────────────────────────────

    pub async fn add_root(&self, path: &str, recursive: bool) -> anyhow::Result<AddRoot> {
        if let Some(row) = sqlx::query("SELECT id FROM roots WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(AddRoot {
                id: row.get(0),
                created: false,
            });
        }
        let id = sqlx::query(
            "INSERT INTO roots (path, recursive, enabled, created_at) VALUES (?1, ?2, 1, ?3)",
        )
        .bind(path)
        .bind(recursive)
        .bind(unix_now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(AddRoot { id, created: true })
    }

    pub async fn get_root(&self, id: i64) -> anyhow::Result<Option<Root>> {
        let root = sqlx::query_as::<_, Root>("SELECT * FROM roots WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(root)
    }

    pub async fn list_roots(&self) -> anyhow::Result<Vec<Root>> {
        let roots = sqlx::query_as::<_, Root>("SELECT * FROM roots ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(roots)
    }

    pub async fn enabled_roots(&self) -> anyhow::Result<Vec<Root>> {
        let roots = sqlx::query_as::<_, Root>("SELECT * FROM roots WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(roots)
    }

    /// Delete a root and every file row under it (queue entries cascade).
    pub async fn delete_root(&self, id: i64) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query("SELECT path FROM roots WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(false);
        };
        let path: String = row.get(0);
        let prefix = format!("{}/%", path.trim_end_matches('/'));
        sqlx::query("DELETE FROM files WHERE root_id = ?1 OR path LIKE ?2")
            .bind(id)
            .bind(prefix)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM roots WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn touch_root_scanned(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE roots SET last_scanned_at = ?1 WHERE id = ?2")
            .bind(unix_now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Excludes ───────────────────────────────────────────────────────

    pub async fn add_exclude(&self, pattern: &str) -> anyhow::Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO excludes (pattern) VALUES (?1)")
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM excludes WHERE pattern = ?1")
            .bind(pattern)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn list_excludes(&self) -> anyhow::Result<Vec<Exclude>> {
        let rows = sqlx::query_as::<_, Exclude>("SELECT * FROM excludes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn delete_exclude(&self, id: i64) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM excludes WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    // ── Servers ────────────────────────────────────────────────────────

    pub async fn add_server(
        &self,
        name: &str,
        base_url: &str,
        username: &str,
        secret: &str,
        is_default: bool,
    ) -> anyhow::Result<i64> {
        let mut tx = self.pool.begin().await?;
        if is_default {
            sqlx::query("UPDATE servers SET is_default = 0")
                .execute(&mut *tx)
                .await?;
        }
        let id = sqlx::query(
            "INSERT INTO servers (name, base_url, username, secret, is_default)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(name)
        .bind(base_url.trim_end_matches('/'))
        .bind(username)
        .bind(secret)
        .bind(is_default)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;
        Ok(id)
    }

    pub async fn list_servers(&self) -> anyhow::Result<Vec<Server>> {
        let rows = sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn delete_server(&self, id: i64) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM servers WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_default_server(&self, id: i64) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE servers SET is_default = 0")
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("UPDATE servers SET is_default = 1 WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            // Unknown id: roll back so the previous default survives.
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn default_server(&self) -> anyhow::Result<Option<Server>> {
        let row = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE is_default = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Cache a freshly acquired bearer token on the server row.
    pub async fn cache_token(&self, id: i64, token: &str, expiry: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE servers SET token = ?1, token_expiry = ?2 WHERE id = ?3")
            .bind(token)
            .bind(expiry)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn evict_token(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE servers SET token = NULL, token_expiry = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Files ──────────────────────────────────────────────────────────

    /// Record one scan observation: upsert the file row, enqueue a checksum
    /// entry when new or changed, and append the matching activity event.
    /// All three commit together.
    pub async fn record_scanned(&self, file: &ScannedFile) -> anyhow::Result<Discovery> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id, size, mtime_ns, status FROM files WHERE path = ?1")
            .bind(&file.path)
            .fetch_optional(&mut *tx)
            .await?;

        let discovery = match existing {
            None => {
                let file_id = sqlx::query(
                    "INSERT INTO files (path, root_id, size, mtime_ns, mode, uid, gid,
                                        is_symlink, link_target, status, discovered_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'discovered', ?10, ?10)",
                )
                .bind(&file.path)
                .bind(file.root_id)
                .bind(file.size)
                .bind(file.mtime_ns)
                .bind(file.mode)
                .bind(file.uid)
                .bind(file.gid)
                .bind(file.is_symlink)
                .bind(&file.link_target)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
                crate::queue::enqueue_tx(&mut tx, QueueKind::PendingChecksum, file_id, true)
                    .await?;
                crate::activity::append_tx(
                    &mut tx,
                    ActivityKind::FileDiscovered,
                    Some(&file.path),
                    Some(file.root_id),
                    None,
                    Some(serde_json::json!({ "size": file.size })),
                )
                .await?;
                Discovery::New
            }
            Some(row) => {
                let file_id: i64 = row.get(0);
                let old_size: i64 = row.get(1);
                let old_mtime: i64 = row.get(2);
                let status: String = row.get(3);
                let changed = old_size != file.size || old_mtime != file.mtime_ns;
                let was_gone = status == "deleted";
                // A terminally failed file gets another chance on rescan.
                let needs_work = changed || was_gone || status == "failed";
                if !needs_work {
                    tx.commit().await?;
                    return Ok(Discovery::Unchanged);
                }
                sqlx::query(
                    "UPDATE files SET root_id = ?1, size = ?2, mtime_ns = ?3, mode = ?4,
                                      uid = ?5, gid = ?6, is_symlink = ?7, link_target = ?8,
                                      status = 'discovered', last_error = NULL, updated_at = ?9
                     WHERE id = ?10",
                )
                .bind(file.root_id)
                .bind(file.size)
                .bind(file.mtime_ns)
                .bind(file.mode)
                .bind(file.uid)
                .bind(file.gid)
                .bind(file.is_symlink)
                .bind(&file.link_target)
                .bind(now)
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
                // The pipeline restarts for this path; drop whatever the
                // downstream stages still had queued for it.
                crate::queue::clear_other_kinds_tx(&mut tx, file_id, QueueKind::PendingChecksum)
                    .await?;
                crate::queue::enqueue_tx(&mut tx, QueueKind::PendingChecksum, file_id, true)
                    .await?;
                let kind = if was_gone {
                    ActivityKind::FileDiscovered
                } else {
                    ActivityKind::FileChanged
                };
                crate::activity::append_tx(
                    &mut tx,
                    kind,
                    Some(&file.path),
                    Some(file.root_id),
                    None,
                    Some(serde_json::json!({ "size": file.size })),
                )
                .await?;
                if was_gone {
                    Discovery::New
                } else {
                    Discovery::Changed
                }
            }
        };

        tx.commit().await?;
        Ok(discovery)
    }

    /// Mark a watched path as deleted and enqueue the deletion drain entry.
    pub async fn mark_deleted(&self, path: &str) -> anyhow::Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            "UPDATE files SET status = 'deleted', updated_at = ?1
             WHERE path = ?2 AND status != 'deleted' RETURNING id",
        )
        .bind(unix_now())
        .bind(path)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };
        let file_id: i64 = row.get(0);
        // Deletion supersedes any pending checksum or upload work.
        crate::queue::clear_other_kinds_tx(&mut tx, file_id, QueueKind::PendingDeletion).await?;
        crate::queue::enqueue_tx(&mut tx, QueueKind::PendingDeletion, file_id, false).await?;
        tx.commit().await?;
        Ok(Some(file_id))
    }

    pub async fn get_file(&self, id: i64) -> anyhow::Result<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_file_by_path(&self, path: &str) -> anyhow::Result<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_files(&self, filter: &FileFilter) -> anyhow::Result<(Vec<FileRow>, i64)> {
        let mut qb = QueryBuilder::new("SELECT * FROM files WHERE 1=1");
        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM files WHERE 1=1");
        for builder in [&mut qb, &mut count_qb] {
            if let Some(prefix) = &filter.path_prefix {
                builder.push(" AND path LIKE ");
                builder.push_bind(format!("{}%", prefix));
            }
            if let Some(sha) = &filter.sha256 {
                builder.push(" AND sha256 = ");
                builder.push_bind(sha.clone());
            }
        }
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;
        qb.push(" ORDER BY id LIMIT ");
        qb.push_bind(if filter.limit > 0 { filter.limit } else { 100 });
        qb.push(" OFFSET ");
        qb.push_bind(filter.offset.max(0));
        let rows = qb.build_query_as::<FileRow>().fetch_all(&self.pool).await?;
        Ok((rows, total))
    }

    pub async fn set_file_status(&self, id: i64, status: FileStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE files SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(unix_now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_file_error(&self, id: i64, error: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE files SET last_error = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(error)
            .bind(unix_now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_file_failed(&self, id: i64, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE files SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(error)
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a finished fingerprint. Unchanged digests short-circuit to
    /// `completed`; new digests move the file to `ready_for_upload` and
    /// enqueue it. The checksum claim (when given) is dropped in the same
    /// transaction, so no file ever holds two live claims. On the worker
    /// path (an entry id is given) the update only applies while the row is
    /// still `hashing` — a scan observation committed mid-hash wins, and
    /// the digest is discarded as `Superseded`.
    pub async fn finish_fingerprint(
        &self,
        file_id: i64,
        entry_id: Option<i64>,
        sha256: &str,
        size: i64,
        mtime_ns: i64,
        upload_content: bool,
    ) -> anyhow::Result<FingerprintOutcome> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;
        let prior: Option<String> = sqlx::query_scalar("SELECT sha256 FROM files WHERE id = ?1")
            .bind(file_id)
            .fetch_one(&mut *tx)
            .await?;
        let unchanged = prior.as_deref() == Some(sha256);
        let status = if unchanged {
            FileStatus::Completed
        } else {
            FileStatus::ReadyForUpload
        };

        let mut sql = String::from(
            "UPDATE files SET sha256 = ?1, size = ?2, mtime_ns = ?3, status = ?4,
                              last_error = NULL, updated_at = ?5 WHERE id = ?6",
        );
        if entry_id.is_some() {
            sql.push_str(" AND status = 'hashing'");
        }
        let res = sqlx::query(&sql)
            .bind(sha256)
            .bind(size)
            .bind(mtime_ns)
            .bind(status.as_str())
            .bind(now)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        if res.rows_affected() == 0 {
            // The entry row doubles as the queue item for the newer
            // observation (the re-enqueue deduped onto it), so release the
            // claim instead of dropping it.
            if let Some(entry_id) = entry_id {
                sqlx::query(
                    "UPDATE queue_entries SET next_visible_at = ?1, claim_token = NULL
                     WHERE id = ?2",
                )
                .bind(now)
                .bind(entry_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            return Ok(FingerprintOutcome::Superseded);
        }
        if !unchanged {
            crate::queue::enqueue_tx(&mut tx, QueueKind::PendingUpload, file_id, upload_content)
                .await?;
        }
        if let Some(entry_id) = entry_id {
            sqlx::query("DELETE FROM queue_entries WHERE id = ?1")
                .bind(entry_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(if unchanged {
            FingerprintOutcome::Unchanged
        } else {
            FingerprintOutcome::NeedsUpload
        })
    }

    /// Re-enqueue `ready_for_upload` files for the upload trigger. Files
    /// already sitting in the upload queue are skipped.
    pub async fn enqueue_ready_uploads(
        &self,
        path_prefix: Option<&str>,
        limit: i64,
        upload_content: bool,
    ) -> anyhow::Result<u64> {
        let mut qb = QueryBuilder::new(
            "SELECT id FROM files WHERE status = 'ready_for_upload'
             AND NOT EXISTS (SELECT 1 FROM queue_entries q
                             WHERE q.kind = 'pending_upload' AND q.file_id = files.id)",
        );
        if let Some(prefix) = path_prefix {
            qb.push(" AND path LIKE ");
            qb.push_bind(format!("{}%", prefix));
        }
        qb.push(" ORDER BY id LIMIT ");
        qb.push_bind(if limit > 0 { limit } else { i64::MAX });
        let ids: Vec<i64> = qb.build_query_scalar().fetch_all(&self.pool).await?;

        let mut queued = 0u64;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            if crate::queue::enqueue_tx(&mut tx, QueueKind::PendingUpload, id, upload_content)
                .await?
            {
                queued += 1;
            }
        }
        tx.commit().await?;
        Ok(queued)
    }

    // ── Stats ──────────────────────────────────────────────────────────

    pub async fn stats(&self) -> anyhow::Result<StoreStats> {
        let status_rows =
            sqlx::query("SELECT status, COUNT(*) FROM files GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut by_status = HashMap::new();
        let mut files_tracked = 0i64;
        for row in status_rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            if status != "deleted" {
                files_tracked += count;
            }
            by_status.insert(status, count);
        }
        let queue_rows =
            sqlx::query("SELECT kind, COUNT(*) FROM queue_entries GROUP BY kind ORDER BY kind")
                .fetch_all(&self.pool)
                .await?;
        let mut queues = HashMap::new();
        for kind in QueueKind::ALL {
            queues.insert(kind.as_str().to_string(), 0);
        }
        for row in queue_rows {
            let kind: String = row.get(0);
            let count: i64 = row.get(1);
            queues.insert(kind, count);
        }
        Ok(StoreStats {
            files_tracked,
            by_status,
            queues,
        })
    }
}

pub(crate) type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;
