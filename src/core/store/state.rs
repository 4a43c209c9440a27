use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::{AnalysisStatus, CompanyAnalysisState, FinishedState};
use super::{Store, bool_col, json_col};

const STATE_COLUMNS: &str = "company_id, status, stage, progress, last_started_at, last_finished_at,
    duration_seconds, attempts, stop_requested, analysis_ok, server_error, no_valid_site,
    info_json, updated_at";

fn map_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompanyAnalysisState> {
    let status: String = row.get(1)?;
    Ok(CompanyAnalysisState {
        company_id: row.get(0)?,
        status: AnalysisStatus::from_status(&status).unwrap_or(AnalysisStatus::Idle),
        stage: row.get(2)?,
        progress: row.get(3)?,
        last_started_at: row.get(4)?,
        last_finished_at: row.get(5)?,
        duration_seconds: row.get(6)?,
        attempts: row.get(7)?,
        stop_requested: bool_col(row, 8)?,
        analysis_ok: bool_col(row, 9)?,
        server_error: bool_col(row, 10)?,
        no_valid_site: bool_col(row, 11)?,
        info: json_col(row, 12)?,
        updated_at: row.get(13)?,
    })
}

impl Store {
    /// Fresh enqueue: status `queued`, progress and stop flag cleared.
    /// A job in flight keeps its row; [Store::requeue_if_pending] flips it
    /// once that job ends.
    pub async fn mark_queued(&self, company_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO company_analysis_state (company_id, status, progress, stop_requested)
             VALUES (?1, 'queued', 0, 0)
             ON CONFLICT(company_id) DO UPDATE SET
                status = 'queued',
                stage = NULL,
                progress = 0,
                stop_requested = 0,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_analysis_state.status NOT IN ('running', 'stopping')",
            params![company_id],
        )?;
        Ok(())
    }

    /// After a job ends, show the company as `queued` again if a new request
    /// for it arrived meanwhile. Returns whether one was waiting.
    pub async fn requeue_if_pending(&self, company_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let n = db.execute(
            "UPDATE company_analysis_state SET
                status = 'queued',
                stage = NULL,
                progress = 0,
                stop_requested = 0,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1
               AND EXISTS (SELECT 1 FROM analysis_queue WHERE company_id = ?1)",
            params![company_id],
        )?;
        Ok(n > 0)
    }

    /// A deferred job goes back to `queued` but keeps its progress.
    pub async fn mark_deferred(&self, company_id: &str, info: &serde_json::Value) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE company_analysis_state SET
                status = 'queued',
                last_finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                server_error = 1,
                info_json = ?2,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1",
            params![company_id, info.to_string()],
        )?;
        Ok(())
    }

    pub async fn mark_running(
        &self,
        company_id: &str,
        stage: Option<&str>,
        progress: f64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO company_analysis_state
                (company_id, status, stage, progress, last_started_at, attempts)
             VALUES (?1, 'running', ?2, ?3, strftime('%Y-%m-%dT%H:%M:%fZ','now'), 1)
             ON CONFLICT(company_id) DO UPDATE SET
                status = 'running',
                stage = ?2,
                progress = ?3,
                last_started_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                last_finished_at = NULL,
                duration_seconds = NULL,
                attempts = attempts + 1,
                stop_requested = 0,
                analysis_ok = 0,
                server_error = 0,
                no_valid_site = 0,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')",
            params![company_id, stage, progress],
        )?;
        Ok(())
    }

    /// Record a finished step. Progress never moves backwards while running.
    pub async fn update_progress(&self, company_id: &str, stage: &str, progress: f64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE company_analysis_state SET
                stage = ?2,
                progress = MAX(progress, ?3),
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1 AND status IN ('running', 'stopping')",
            params![company_id, stage, progress],
        )?;
        Ok(())
    }

    pub async fn mark_finished(&self, company_id: &str, finished: FinishedState<'_>) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE company_analysis_state SET
                status = ?2,
                progress = COALESCE(?3, progress),
                last_finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                duration_seconds = ?4,
                analysis_ok = ?5,
                server_error = ?6,
                info_json = ?7,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1",
            params![
                company_id,
                finished.status.as_str(),
                finished.progress,
                finished.duration_seconds,
                finished.analysis_ok as i64,
                finished.server_error as i64,
                finished.info.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Flag queued or running companies as stopping. Terminal ones are left
    /// untouched. Returns the ids that were flagged.
    pub async fn request_stop(&self, company_ids: &[String]) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut flagged = Vec::new();
        let mut stmt = db.prepare(
            "UPDATE company_analysis_state SET
                status = 'stopping',
                stop_requested = 1,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1 AND status IN ('queued', 'running', 'stopping')",
        )?;
        for id in company_ids {
            if stmt.execute(params![id])? > 0 {
                flagged.push(id.clone());
            }
        }
        Ok(flagged)
    }

    /// Mark a job `stopped` unconditionally (used for the job that was running).
    pub async fn mark_stopped(&self, company_id: &str, duration_seconds: Option<f64>) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE company_analysis_state SET
                status = 'stopped',
                last_finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                duration_seconds = COALESCE(?2, duration_seconds),
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1",
            params![company_id, duration_seconds],
        )?;
        Ok(())
    }

    /// Mark a not-yet-started job `stopped`. Returns false when the company was
    /// already terminal or running, leaving it unchanged.
    pub async fn stop_if_pending(&self, company_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE company_analysis_state SET
                status = 'stopped',
                last_finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1
               AND (status = 'queued'
                    OR (status = 'stopping'
                        AND NOT (last_started_at IS NOT NULL AND last_finished_at IS NULL)))",
            params![company_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn set_no_valid_site(&self, company_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE company_analysis_state SET no_valid_site = 1,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1",
            params![company_id],
        )?;
        Ok(())
    }

    /// Back to `idle` for companies that are not currently running.
    pub async fn reset_states(&self, company_ids: &[String]) -> Result<usize> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "UPDATE company_analysis_state SET
                status = 'idle',
                stage = NULL,
                progress = 0,
                stop_requested = 0,
                analysis_ok = 0,
                server_error = 0,
                no_valid_site = 0,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE company_id = ?1 AND status NOT IN ('running', 'stopping')",
        )?;
        let mut n = 0;
        for id in company_ids {
            n += stmt.execute(params![id])?;
        }
        Ok(n)
    }

    pub async fn get_state(&self, company_id: &str) -> Result<Option<CompanyAnalysisState>> {
        let db = self.db.lock().await;
        let state = db
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM company_analysis_state WHERE company_id = ?1"),
                params![company_id],
                map_state_row,
            )
            .optional()?;
        Ok(state)
    }

    pub async fn get_states(&self, company_ids: &[String]) -> Result<Vec<CompanyAnalysisState>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM company_analysis_state WHERE company_id = ?1"
        ))?;
        let mut out = Vec::new();
        for id in company_ids {
            if let Some(state) = stmt.query_row(params![id], map_state_row).optional()? {
                out.push(state);
            }
        }
        Ok(out)
    }

    /// States currently being worked on (`running` or `stopping` mid-run).
    pub async fn list_active_states(&self, limit: usize) -> Result<Vec<CompanyAnalysisState>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM company_analysis_state
             WHERE status = 'running'
                OR (status = 'stopping' AND last_started_at IS NOT NULL AND last_finished_at IS NULL)
             ORDER BY last_started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_state_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
