use anyhow::Result;
use rusqlite::params;
use tracing::warn;

use super::Store;
use super::types::{StopCommand, StopPayload};

impl Store {
    pub async fn add_stop_command(&self, company_ids: &[String]) -> Result<i64> {
        let payload = serde_json::to_string(&StopPayload {
            company_ids: company_ids.to_vec(),
        })?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO analysis_commands (action, payload_json) VALUES ('stop', ?1)",
            params![payload],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Read and delete every pending command in one statement.
    pub async fn take_stop_commands(&self) -> Result<Vec<StopCommand>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "DELETE FROM analysis_commands WHERE action = 'stop' RETURNING id, action, payload_json",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, action, payload_json) = row?;
            match serde_json::from_str::<StopPayload>(&payload_json) {
                Ok(payload) => out.push(StopCommand { action, payload }),
                Err(e) => warn!("Dropping malformed stop command {}: {}", id, e),
            }
        }
        Ok(out)
    }
}
