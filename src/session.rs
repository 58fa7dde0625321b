//! Session store: a durable `session_id -> user_id` table with time-based
//! eviction, shared across every dispatcher on the proxy.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::ProxyError;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");
const EVICTION_AGE_SECS: i64 = 2 * 24 * 60 * 60;
const EVICTION_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Shared, durable `session_id -> user_id` bindings.
///
/// Cloning is cheap — it shares the underlying connection and eviction
/// task handle, matching the pattern used for the proxy's other
/// cross-dispatcher shared state.
pub struct SessionStore {
    conn: std::sync::Arc<Mutex<Connection>>,
    shutdown_tx: watch::Sender<bool>,
    evict_task: Option<tokio::task::JoinHandle<()>>,
}

impl SessionStore {
    /// Open (creating if necessary) the session database at
    /// `<workdir>/sessions/sessions.db` and start the daily eviction
    /// task.
    pub fn open(workdir: &Path) -> Result<Self, ProxyError> {
        let dir = workdir.join("sessions");
        std::fs::create_dir_all(&dir)?;
        Self::open_at(&dir.join("sessions.db"))
    }

    /// Open at an explicit path (used directly by tests).
    pub fn open_at(db_path: &Path) -> Result<Self, ProxyError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        let conn = std::sync::Arc::new(Mutex::new(conn));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let evict_task = tokio::spawn(eviction_loop(conn.clone(), shutdown_rx));

        info!(path = %db_path.display(), "session store opened");
        Ok(Self {
            conn,
            shutdown_tx,
            evict_task: Some(evict_task),
        })
    }

    /// Run `PRAGMA integrity_check` against the database. Called once at
    /// startup, before the listener accepts any POS connections.
    pub async fn integrity_check(&self) -> Result<(), ProxyError> {
        let conn = self.conn.lock().await;
        let result: String =
            conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(ProxyError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    /// Insert or replace the binding for `session_id`, timestamped now.
    pub async fn put(&self, session_id: &str, user_id: &str) -> Result<(), ProxyError> {
        let now = now_unix();
        let conn = self.conn.lock().await;
        conn.execute(
            "REPLACE INTO SessionUsers (session_id, user_id, timestamp) VALUES (?1, ?2, ?3)",
            rusqlite::params![session_id, user_id, now],
        )?;
        debug!(session_id, user_id, "session bound");
        Ok(())
    }

    /// Look up the `user_id` bound to `session_id`. A missing binding is
    /// `Ok(None)`, not an error.
    pub async fn get(&self, session_id: &str) -> Result<Option<String>, ProxyError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT user_id FROM SessionUsers WHERE session_id = ?1")?;
        let mut rows = stmt.query_map(rusqlite::params![session_id], |row| row.get(0))?;
        Ok(rows.next().transpose()?)
    }

    /// Cancel the eviction task and release the connection.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.evict_task.take() {
            let _ = task.await;
        }
    }
}

async fn eviction_loop(
    conn: std::sync::Arc<Mutex<Connection>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let cutoff = now_unix() - EVICTION_AGE_SECS;
        {
            let conn = conn.lock().await;
            match conn.execute(
                "DELETE FROM SessionUsers WHERE timestamp < ?1",
                rusqlite::params![cutoff],
            ) {
                Ok(deleted) if deleted > 0 => {
                    debug!(deleted, "evicted stale session bindings");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "session eviction query failed"),
            }
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(std::time::Duration::from_secs(EVICTION_INTERVAL_SECS)) => {}
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
