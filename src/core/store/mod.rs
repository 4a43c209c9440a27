mod commands;
mod companies;
mod events;
mod lock;
mod queue;
mod state;
pub mod types;

use anyhow::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

pub use events::MAX_PAGE_SIZE;
pub use lock::{ANALYSIS_LOCK_KEY, RunnerLock};

/// Durable state for the analysis pipeline: queue, per-company state, stop
/// commands, the event log, runner leases and the companies directory.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
    path: PathBuf,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS analysis_queue (
        company_id TEXT PRIMARY KEY,
        queued_at TEXT NOT NULL,
        seq INTEGER NOT NULL,
        queued_by TEXT,
        payload_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_analysis_queue_order ON analysis_queue(queued_at, seq)",
    "CREATE TABLE IF NOT EXISTS company_analysis_state (
        company_id TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'idle',
        stage TEXT,
        progress REAL NOT NULL DEFAULT 0,
        last_started_at TEXT,
        last_finished_at TEXT,
        duration_seconds REAL,
        attempts INTEGER NOT NULL DEFAULT 0,
        stop_requested INTEGER NOT NULL DEFAULT 0,
        analysis_ok INTEGER NOT NULL DEFAULT 0,
        server_error INTEGER NOT NULL DEFAULT 0,
        no_valid_site INTEGER NOT NULL DEFAULT 0,
        info_json TEXT,
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )",
    "CREATE TABLE IF NOT EXISTS analysis_commands (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )",
    "CREATE TABLE IF NOT EXISTS analysis_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        event_type TEXT NOT NULL,
        source TEXT NOT NULL,
        direction TEXT,
        request_id TEXT,
        company_id TEXT,
        company_name TEXT,
        message TEXT,
        payload_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_analysis_events_created ON analysis_events(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_analysis_events_company ON analysis_events(company_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_analysis_events_type ON analysis_events(event_type, id)",
    "CREATE TABLE IF NOT EXISTS runner_locks (
        lock_key INTEGER PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS companies (
        inn TEXT PRIMARY KEY,
        short_name TEXT,
        okved TEXT,
        industry TEXT,
        status TEXT,
        analysis_ok INTEGER NOT NULL DEFAULT 0,
        server_error INTEGER NOT NULL DEFAULT 0,
        no_valid_site INTEGER NOT NULL DEFAULT 0,
        analysis_started_at TEXT,
        analysis_status TEXT,
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )",
];

impl Store {
    /// Open (or create) the database and run the schema bootstrap once.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
        }

        let db = Connection::open(&path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "synchronous", "NORMAL")?;
        migrate(&db)?;

        info!("Analysis store ready at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn migrate(db: &Connection) -> Result<()> {
    for stmt in SCHEMA {
        db.execute(stmt, [])?;
    }
    Ok(())
}

fn bool_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i64>(idx)? != 0)
}

fn json_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

/// Create a store backed by a unique temp file. Each call gets a fresh database.
#[cfg(test)]
pub async fn test_store() -> Store {
    let path = std::env::temp_dir()
        .join(format!("analysisd-test-{}", uuid::Uuid::new_v4()))
        .join("analysis.db");
    Store::open(&path).await.expect("open test store")
}
