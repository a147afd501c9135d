//! Scheduling store using SQLite

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use tracing::debug;

use crate::{Error, Result};

/// A persisted delayed task
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEntry {
    /// Unique key; at most one entry exists per key
    pub key: String,
    /// Identifier of the handler that runs the task
    pub task_type: String,
    pub fire_at: DateTime<Utc>,
    pub payload: JsonValue,
    /// Identifies this particular arming of `key`; a timer only fires the
    /// entry whose token it was armed with
    pub token: String,
}

impl ScheduledEntry {
    /// Create an entry with a fresh arming token
    pub fn new(
        key: impl Into<String>,
        task_type: impl Into<String>,
        fire_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            key: key.into(),
            task_type: task_type.into(),
            fire_at,
            payload,
            token: uuid::Uuid::now_v7().to_string(),
        }
    }
}

fn encode_instant(instant: &DateTime<Utc>) -> String {
    // Fixed-width so that ORDER BY on the text column is chronological
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_instant(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledEntry> {
    let fire_at: String = row.get(2)?;
    let payload: String = row.get(3)?;
    Ok(ScheduledEntry {
        key: row.get(0)?,
        task_type: row.get(1)?,
        fire_at: decode_instant(&fire_at)?,
        payload: serde_json::from_str(&payload).map_err(|_| rusqlite::Error::InvalidQuery)?,
        token: row.get(4)?,
    })
}

const SELECT_COLUMNS: &str = "SELECT key, task_type, fire_at, payload, token FROM scheduled_tasks";

/// SQLite-based store of scheduled tasks keyed by string
pub struct ScheduleStore {
    conn: Connection,
}

impl ScheduleStore {
    /// Open (or create) the store at the given database path
    pub fn new(db_path: &str) -> Result<Self> {
        debug!("Opening schedule database at: {}", db_path);
        let conn = Connection::open(db_path)?;
        let store = Self { conn };
        store.init_tables()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                key TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                token TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_fire_at ON scheduled_tasks(fire_at)",
            [],
        )?;

        Ok(())
    }

    /// Insert or replace the entry for `entry.key`
    pub fn upsert(&self, entry: &ScheduledEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO scheduled_tasks (key, task_type, fire_at, payload, token, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.key,
                    entry.task_type,
                    encode_instant(&entry.fire_at),
                    payload,
                    entry.token,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| Error::StoreWrite(format!("{}: {}", entry.key, e)))?;
        Ok(())
    }

    /// Remove the entry for `key`, returning whether one existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM scheduled_tasks WHERE key = ?1", params![key])
            .map_err(|e| Error::StoreWrite(format!("{}: {}", key, e)))?;
        Ok(affected > 0)
    }

    /// Look up the entry for `key`
    pub fn get(&self, key: &str) -> Result<Option<ScheduledEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("{} WHERE key = ?1", SELECT_COLUMNS),
                params![key],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// All keys currently stored
    pub fn all_keys(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM scheduled_tasks")?;
        let keys = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut result = BTreeSet::new();
        for key in keys {
            result.insert(key?);
        }
        Ok(result)
    }

    /// All entries ordered by fire time
    pub fn list(&self) -> Result<Vec<ScheduledEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY fire_at ASC", SELECT_COLUMNS))?;
        let entries = stmt.query_map([], entry_from_row)?;

        let mut result = Vec::new();
        for entry in entries {
            result.push(entry?);
        }
        Ok(result)
    }

    /// Take the entry for `key` if it is still armed with `token`
    ///
    /// Returns `None` when the entry was replaced or removed in the meantime.
    /// A taken entry is deleted, so each arming is delivered at most once.
    pub fn claim(&self, key: &str, token: &str) -> Result<Option<ScheduledEntry>> {
        let tx = self.conn.unchecked_transaction()?;
        let entry = tx
            .query_row(
                &format!("{} WHERE key = ?1 AND token = ?2", SELECT_COLUMNS),
                params![key, token],
                entry_from_row,
            )
            .optional()?;

        if entry.is_some() {
            tx.execute(
                "DELETE FROM scheduled_tasks WHERE key = ?1 AND token = ?2",
                params![key, token],
            )?;
        }
        tx.commit()?;
        Ok(entry)
    }

    /// Delete every entry due at or before `now`, returning their keys
    pub fn discard_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let tx = self.conn.unchecked_transaction()?;
        let cutoff = encode_instant(&now);

        let keys = {
            let mut stmt = tx.prepare("SELECT key FROM scheduled_tasks WHERE fire_at <= ?1")?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for key in rows {
                keys.push(key?);
            }
            keys
        };

        tx.execute("DELETE FROM scheduled_tasks WHERE fire_at <= ?1", params![cutoff])?;
        tx.commit()?;
        Ok(keys)
    }

    /// Number of stored entries
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scheduled_tasks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
