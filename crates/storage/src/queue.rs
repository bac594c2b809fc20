//! Durable work queues with lease-based claims.
//!
//! A claim is a single atomic UPDATE that stamps a claim token and pushes
//! `next_visible_at` past the lease. No sweeper is needed: once the lease
//! expires the entry satisfies the claim predicate again.

use sqlx::Row;
use uuid::Uuid;

use crate::models::{QueueEntry, QueueKind};
use crate::store::{Store, Tx};
use crate::unix_now;

/// Drop this file's entries in every queue except `keep`, claimed or not.
/// A newer observation supersedes whatever the other stages still had
/// queued, so a file never holds live entries in two queues at once.
pub(crate) async fn clear_other_kinds_tx(
    tx: &mut Tx<'_>,
    file_id: i64,
    keep: QueueKind,
) -> anyhow::Result<u64> {
    let res = sqlx::query("DELETE FROM queue_entries WHERE file_id = ?1 AND kind != ?2")
        .bind(file_id)
        .bind(keep.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected())
}

/// Insert a queue entry inside an open transaction. Returns false when the
/// file already has an entry in that queue (the unique index dedupes).
pub(crate) async fn enqueue_tx(
    tx: &mut Tx<'_>,
    kind: QueueKind,
    file_id: i64,
    upload_content: bool,
) -> anyhow::Result<bool> {
    let now = unix_now();
    let res = sqlx::query(
        "INSERT OR IGNORE INTO queue_entries (kind, file_id, upload_content, enqueued_at, next_visible_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
    )
    .bind(kind.as_str())
    .bind(file_id)
    .bind(upload_content)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() > 0)
}

impl Store {
    pub async fn enqueue(
        &self,
        kind: QueueKind,
        file_id: i64,
        upload_content: bool,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool().begin().await?;
        let inserted = enqueue_tx(&mut tx, kind, file_id, upload_content).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Claim up to `limit` visible entries, extending their visibility by
    /// `lease_secs`. FIFO by `(next_visible_at, id)`; exactly one worker can
    /// hold an entry until it completes, fails, or the lease runs out.
    pub async fn claim(
        &self,
        kind: QueueKind,
        limit: i64,
        lease_secs: i64,
    ) -> anyhow::Result<Vec<QueueEntry>> {
        let now = unix_now();
        let token = Uuid::new_v4().to_string();
        let entries = sqlx::query_as::<_, QueueEntry>(
            "UPDATE queue_entries
             SET next_visible_at = ?1, claim_token = ?2
             WHERE id IN (
                 SELECT id FROM queue_entries
                 WHERE kind = ?3 AND next_visible_at <= ?4
                 ORDER BY next_visible_at, id
                 LIMIT ?5
             )
             RETURNING *",
        )
        .bind(now + lease_secs)
        .bind(token)
        .bind(kind.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(entries)
    }

    /// Drop a drained entry.
    pub async fn complete(&self, entry_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM queue_entries WHERE id = ?1")
            .bind(entry_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record a failed attempt: bump `attempts`, release the claim, and
    /// schedule the entry `backoff_secs` into the future. The error lands
    /// on the file row for the UI.
    pub async fn fail(
        &self,
        entry_id: i64,
        error: &str,
        backoff_secs: i64,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool().begin().await?;
        let Some(row) = sqlx::query(
            "UPDATE queue_entries
             SET attempts = attempts + 1, next_visible_at = ?1, claim_token = NULL
             WHERE id = ?2
             RETURNING file_id",
        )
        .bind(unix_now() + backoff_secs)
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(());
        };
        let file_id: i64 = row.get(0);
        sqlx::query("UPDATE files SET last_error = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(error)
            .bind(unix_now())
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Finish an upload: the file becomes `completed` and the claim is
    /// dropped in the same transaction. The status guard keeps a shipment
    /// of stale bytes from clobbering a file that was re-discovered while
    /// the upload was in flight.
    pub async fn complete_upload(&self, entry_id: i64, file_id: i64) -> anyhow::Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "UPDATE files SET status = 'completed', last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'uploading'",
        )
        .bind(unix_now())
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_entries WHERE id = ?1")
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Give a claimed-but-unfinished entry back to the queue immediately.
    /// Used on shutdown so a restart does not have to wait out the lease.
    pub async fn release(&self, entry_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE queue_entries SET next_visible_at = ?1, claim_token = NULL WHERE id = ?2",
        )
        .bind(unix_now())
        .bind(entry_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn queue_len(&self, kind: QueueKind) -> anyhow::Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE kind = ?1")
                .bind(kind.as_str())
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
