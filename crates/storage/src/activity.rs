//! Append-only activity log.
//!
//! Rows are read with an ever-advancing cursor, so SSE consumers replay
//! from any id without a push subscription. Pruning honors a floor id so a
//! slow stream is never pruned out from under its cursor.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

// Fixed-width timestamps keep string comparison in SQL consistent with
// chronological order.
fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

use crate::models::{ActivityKind, ActivityRow};
use crate::store::{Store, Tx};

pub(crate) async fn append_tx(
    tx: &mut Tx<'_>,
    kind: ActivityKind,
    file_path: Option<&str>,
    root_id: Option<i64>,
    message: Option<&str>,
    details: Option<Value>,
) -> anyhow::Result<i64> {
    let id = sqlx::query(
        "INSERT INTO activity (created_at, kind, file_path, root_id, message, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(iso_now())
    .bind(kind.as_str())
    .bind(file_path)
    .bind(root_id)
    .bind(message)
    .bind(details.map(|d| d.to_string()))
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();
    Ok(id)
}

impl Store {
    pub async fn append_activity(
        &self,
        kind: ActivityKind,
        file_path: Option<&str>,
        root_id: Option<i64>,
        message: Option<&str>,
        details: Option<Value>,
    ) -> anyhow::Result<i64> {
        let mut tx = self.pool().begin().await?;
        let id = append_tx(&mut tx, kind, file_path, root_id, message, details).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Read events strictly after `since_id`, oldest first.
    pub async fn read_activity(
        &self,
        since_id: i64,
        limit: i64,
        kind: Option<&str>,
    ) -> anyhow::Result<Vec<ActivityRow>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query_as::<_, ActivityRow>(
                    "SELECT * FROM activity WHERE id > ?1 AND kind = ?2 ORDER BY id LIMIT ?3",
                )
                .bind(since_id)
                .bind(kind)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, ActivityRow>(
                    "SELECT * FROM activity WHERE id > ?1 ORDER BY id LIMIT ?2",
                )
                .bind(since_id)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn last_activity_id(&self) -> anyhow::Result<i64> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM activity")
            .fetch_one(self.pool())
            .await?;
        Ok(id.unwrap_or(0))
    }

    /// Prune by age and count cap, never deleting ids at or above `floor_id`
    /// (the lowest cursor an open SSE stream still needs).
    pub async fn prune_activity(
        &self,
        older_than: chrono::DateTime<Utc>,
        max_events: i64,
        floor_id: Option<i64>,
    ) -> anyhow::Result<u64> {
        let floor = floor_id.unwrap_or(i64::MAX);
        let mut pruned = sqlx::query(
            "DELETE FROM activity WHERE created_at < ?1 AND id < ?2",
        )
        .bind(older_than.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(floor)
        .execute(self.pool())
        .await?
        .rows_affected();

        // Enforce the count cap against whatever the age pass left behind.
        let keep_from: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM activity ORDER BY id DESC LIMIT 1 OFFSET ?1",
        )
        .bind(max_events.max(0))
        .fetch_optional(self.pool())
        .await?;
        if let Some(keep_from) = keep_from {
            pruned += sqlx::query("DELETE FROM activity WHERE id <= ?1 AND id < ?2")
                .bind(keep_from)
                .bind(floor)
                .execute(self.pool())
                .await?
                .rows_affected();
        }
        Ok(pruned)
    }
}
