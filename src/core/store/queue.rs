use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::Store;
use super::types::{QueueItem, QueuePayload};

const QUEUE_COLUMNS: &str = "company_id, queued_at, queued_by, payload_json";

fn map_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let payload_json: String = row.get(3)?;
    let payload: QueuePayload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(QueueItem {
        company_id: row.get(0)?,
        queued_at: row.get(1)?,
        queued_by: row.get(2)?,
        payload,
    })
}

impl Store {
    /// Upsert a job. A re-enqueue refreshes `queued_at` and the ordering
    /// sequence, so the row moves to the tail. `queued_by` is only
    /// overwritten by a non-null value.
    pub async fn enqueue(
        &self,
        company_id: &str,
        payload: &QueuePayload,
        queued_by: Option<&str>,
    ) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO analysis_queue (company_id, queued_at, seq, queued_by, payload_json)
             VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM analysis_queue), ?2, ?3)
             ON CONFLICT(company_id) DO UPDATE SET
                queued_at = excluded.queued_at,
                seq = excluded.seq,
                payload_json = excluded.payload_json,
                queued_by = COALESCE(excluded.queued_by, analysis_queue.queued_by)",
            params![company_id, queued_by, json],
        )?;
        Ok(())
    }

    /// Insert a job only if none is pending for the company. Returns whether
    /// the row was written.
    pub async fn enqueue_if_absent(
        &self,
        company_id: &str,
        payload: &QueuePayload,
        queued_by: Option<&str>,
    ) -> Result<bool> {
        let json = serde_json::to_string(payload)?;
        let db = self.db.lock().await;
        let n = db.execute(
            "INSERT INTO analysis_queue (company_id, queued_at, seq, queued_by, payload_json)
             VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM analysis_queue), ?2, ?3)
             ON CONFLICT(company_id) DO NOTHING",
            params![company_id, queued_by, json],
        )?;
        Ok(n > 0)
    }

    /// Atomically remove and return the oldest queued job.
    ///
    /// The select and delete happen in one statement, so concurrent callers
    /// (other tasks or other processes sharing the file) never receive the
    /// same row.
    pub async fn dequeue_next(&self) -> Result<Option<QueueItem>> {
        let db = self.db.lock().await;
        let item = db
            .query_row(
                &format!(
                    "DELETE FROM analysis_queue
                     WHERE company_id = (
                        SELECT company_id FROM analysis_queue
                        ORDER BY queued_at ASC, seq ASC LIMIT 1
                     )
                     RETURNING {QUEUE_COLUMNS}"
                ),
                [],
                map_queue_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Idempotent bulk delete. Returns the number of rows removed.
    pub async fn remove_from_queue(&self, company_ids: &[String]) -> Result<usize> {
        if company_ids.is_empty() {
            return Ok(0);
        }
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM analysis_queue WHERE company_id = ?1")?;
            for id in company_ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub async fn list_queue(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM analysis_queue ORDER BY queued_at ASC, seq ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_queue_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn queued_item(&self, company_id: &str) -> Result<Option<QueueItem>> {
        let db = self.db.lock().await;
        let item = db
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM analysis_queue WHERE company_id = ?1"),
                params![company_id],
                map_queue_row,
            )
            .optional()?;
        Ok(item)
    }

    pub async fn queue_len(&self) -> Result<i64> {
        let db = self.db.lock().await;
        let n = db.query_row("SELECT COUNT(*) FROM analysis_queue", [], |row| row.get(0))?;
        Ok(n)
    }
}
