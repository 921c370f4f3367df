use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use taskweave_core::error::{Result, WeaveError};
use taskweave_core::traits::ScratchpadStore;
use taskweave_core::types::{ConversationId, ScratchpadItem};

/// SQLite-backed scratchpad with per-conversation cap and expiry.
///
/// Appends go through a single connection, so writes for one
/// conversation are linearizable. Items past the cap or the expiry
/// window are evicted on append; `recent` never returns them.
pub struct SqliteScratchpad {
    conn: Mutex<Connection>,
    cap: usize,
}

impl SqliteScratchpad {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path, cap: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeaveError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| WeaveError::Database(e.to_string()))?;

        // WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| WeaveError::Database(e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scratchpad (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                thought TEXT NOT NULL,
                action TEXT,
                observation TEXT NOT NULL,
                origin INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scratchpad_conversation
                ON scratchpad(conversation_id, id);",
        )
        .map_err(|e| WeaveError::Database(e.to_string()))?;

        debug!(path = %path.display(), cap, "Scratchpad store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            cap,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(cap: usize) -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| WeaveError::Database(e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE scratchpad (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                thought TEXT NOT NULL,
                action TEXT,
                observation TEXT NOT NULL,
                origin INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX idx_scratchpad_conversation
                ON scratchpad(conversation_id, id);",
        )
        .map_err(|e| WeaveError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            cap,
        })
    }

    /// Unexpired item count for a conversation.
    pub fn len(&self, key: &ConversationId) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WeaveError::Database(e.to_string()))?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM scratchpad
                 WHERE conversation_id = ?1 AND expires_at > ?2",
                params![key.0, Utc::now().to_rfc3339()],
                |row| row.get(0),
            )
            .map_err(|e| WeaveError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self, key: &ConversationId) -> Result<bool> {
        Ok(self.len(key)? == 0)
    }
}

impl ScratchpadStore for SqliteScratchpad {
    fn append(
        &self,
        key: &ConversationId,
        item: &ScratchpadItem,
        expiry: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.0.clone();
        let item = item.clone();

        Box::pin(async move {
            let expires_at = item.timestamp
                + chrono::Duration::from_std(expiry)
                    .unwrap_or_else(|_| chrono::Duration::days(365));

            let conn = self
                .conn
                .lock()
                .map_err(|e| WeaveError::Database(e.to_string()))?;

            conn.execute(
                "INSERT INTO scratchpad
                    (conversation_id, thought, action, observation, origin, timestamp, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key,
                    item.thought,
                    item.action,
                    item.observation,
                    item.origin as i64,
                    item.timestamp.to_rfc3339(),
                    expires_at.to_rfc3339(),
                ],
            )
            .map_err(|e| WeaveError::Database(e.to_string()))?;

            // Evict expired rows, then anything past the cap (oldest first).
            conn.execute(
                "DELETE FROM scratchpad
                 WHERE conversation_id = ?1 AND expires_at <= ?2",
                params![key, Utc::now().to_rfc3339()],
            )
            .map_err(|e| WeaveError::Database(e.to_string()))?;

            conn.execute(
                "DELETE FROM scratchpad
                 WHERE conversation_id = ?1 AND id NOT IN (
                     SELECT id FROM scratchpad
                     WHERE conversation_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2
                 )",
                params![key, self.cap as i64],
            )
            .map_err(|e| WeaveError::Database(e.to_string()))?;

            Ok(())
        })
    }

    fn recent(&self, key: &ConversationId, n: usize) -> BoxFuture<'_, Result<Vec<ScratchpadItem>>> {
        let key = key.0.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WeaveError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT thought, action, observation, origin, timestamp
                     FROM scratchpad
                     WHERE conversation_id = ?1 AND expires_at > ?2
                     ORDER BY id DESC
                     LIMIT ?3",
                )
                .map_err(|e| WeaveError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params![key, Utc::now().to_rfc3339(), n as i64], |row| {
                    let thought: String = row.get(0)?;
                    let action: Option<String> = row.get(1)?;
                    let observation: String = row.get(2)?;
                    let origin: i64 = row.get(3)?;
                    let ts_str: String = row.get(4)?;
                    Ok((thought, action, observation, origin, ts_str))
                })
                .map_err(|e| WeaveError::Database(e.to_string()))?;

            let mut items = Vec::new();
            for row in rows {
                let (thought, action, observation, origin, ts_str) =
                    row.map_err(|e| WeaveError::Database(e.to_string()))?;

                let timestamp = DateTime::parse_from_rfc3339(&ts_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());

                items.push(ScratchpadItem {
                    thought,
                    action,
                    observation,
                    origin: origin != 0,
                    timestamp,
                });
            }

            // Query returned newest-first; callers want oldest-first.
            items.reverse();
            Ok(items)
        })
    }
}
