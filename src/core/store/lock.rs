//! Cross-process single-runner lease.
//!
//! The lease lives in the shared database, so every process pointed at the
//! same file competes for the same row. A holder that crashes stops renewing
//! and its lease expires.

use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use std::time::Duration;
use tracing::debug;

use super::Store;

/// Well-known key shared by every instance draining the analysis queue.
pub const ANALYSIS_LOCK_KEY: i64 = 821_300_417;

pub struct RunnerLock {
    store: Store,
    lock_key: i64,
    holder: String,
    lease: Duration,
}

impl RunnerLock {
    /// A fresh holder token is generated per lock handle, so two loops in the
    /// same process exclude each other too.
    pub fn new(store: Store, lock_key: i64, lease: Duration) -> Self {
        Self {
            store,
            lock_key,
            holder: uuid::Uuid::new_v4().to_string(),
            lease,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take the lease if it is free, expired, or already ours. Never blocks on
    /// a live holder.
    pub async fn try_acquire(&self) -> Result<bool> {
        let db = self.store.db.lock().await;
        let rows = db.execute(
            "INSERT INTO runner_locks (lock_key, holder, acquired_at, expires_at)
             VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ','now'),
                     CAST(strftime('%s','now') AS INTEGER) + ?3)
             ON CONFLICT(lock_key) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE runner_locks.holder = excluded.holder
                OR runner_locks.expires_at <= CAST(strftime('%s','now') AS INTEGER)",
            params![self.lock_key, self.holder, self.lease.as_secs() as i64],
        )?;
        debug!(
            "Runner lock {} acquire by {}: {}",
            self.lock_key,
            self.holder,
            rows > 0
        );
        Ok(rows > 0)
    }

    /// Extend the lease. Returns false if it was lost to another holder.
    pub async fn renew(&self) -> Result<bool> {
        let db = self.store.db.lock().await;
        let rows = db.execute(
            "UPDATE runner_locks SET expires_at = CAST(strftime('%s','now') AS INTEGER) + ?3
             WHERE lock_key = ?1 AND holder = ?2",
            params![self.lock_key, self.holder, self.lease.as_secs() as i64],
        )?;
        Ok(rows > 0)
    }

    /// Drop the lease if this handle still holds it.
    pub async fn release(&self) -> Result<bool> {
        let db = self.store.db.lock().await;
        let rows = db.execute(
            "DELETE FROM runner_locks WHERE lock_key = ?1 AND holder = ?2",
            params![self.lock_key, self.holder],
        )?;
        Ok(rows > 0)
    }

    pub async fn current_holder(&self) -> Result<Option<String>> {
        let db = self.store.db.lock().await;
        let holder = db
            .query_row(
                "SELECT holder FROM runner_locks
                 WHERE lock_key = ?1 AND expires_at > CAST(strftime('%s','now') AS INTEGER)",
                params![self.lock_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }
}
