//! Embedded single-writer store backed by a SQLite file.
//!
//! Four key/value tables (`sent_messages`, `scheduled_calls`, `slots`,
//! `meta`) hold JSON documents keyed by their id. A read-only mode is
//! available for the list-only commands.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use super::{sent_message_id, short_id, ScheduledCall, SentMessage, Status, StoreError, Storer};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sent_messages (
    id TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scheduled_calls (
    id TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS slots (
    id TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    id TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Debug)]
pub struct EmbeddedStore {
    path: PathBuf,
    read_only: bool,
}

impl EmbeddedStore {
    /// Open (and initialise) a read-write store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            read_only: false,
        };
        let _ = store.connect()?;
        Ok(store)
    }

    /// Open an existing store without taking the write lock.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            read_only: true,
        };
        let _ = store.connect()?;
        Ok(store)
    }

    /// The default database location under the user data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("callout")
            .join("callout.db")
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        if self.read_only {
            let conn =
                Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            return Ok(conn);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn guard_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    fn put(&self, table: &str, id: &str, value: &str) -> Result<(), StoreError> {
        self.guard_writable()?;
        let conn = self.connect()?;
        conn.execute(
            &format!("INSERT INTO {table} (id, value) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET value = excluded.value"),
            params![id, value],
        )?;
        Ok(())
    }

    fn get(&self, table: &str, id: &str) -> Result<String, StoreError> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT value FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get(0),
        )
        .map_err(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })
    }

    fn list(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("SELECT value FROM {table} ORDER BY id"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        self.guard_writable()?;
        let conn = self.connect()?;
        conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        Ok(())
    }
}

impl Storer for EmbeddedStore {
    fn add_sent_message(
        &self,
        campaign_id: &str,
        call_id: &str,
        message: &SentMessage,
    ) -> Result<(), StoreError> {
        let mut message = message.clone();
        message.id = sent_message_id(campaign_id, call_id, &message.kind, &message.destination);
        message.short_id = short_id(&message.id);
        self.put(
            "sent_messages",
            &message.id,
            &serde_json::to_string(&message)?,
        )
    }

    fn update_sent_message(&self, message: &SentMessage) -> Result<(), StoreError> {
        self.put(
            "sent_messages",
            &message.id,
            &serde_json::to_string(message)?,
        )
    }

    fn has_been_sent(
        &self,
        campaign_id: &str,
        call_id: &str,
        kind: &str,
        destination: &str,
    ) -> Result<bool, StoreError> {
        let id = sent_message_id(campaign_id, call_id, kind, destination);
        match self.get("sent_messages", &id) {
            Ok(value) => {
                let message: SentMessage = serde_json::from_str(&value)?;
                Ok(matches!(
                    message.status,
                    Status::Sent | Status::Deleted | Status::Skipped
                ))
            }
            Err(StoreError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn get_sent_message(&self, id: &str) -> Result<SentMessage, StoreError> {
        Ok(serde_json::from_str(&self.get("sent_messages", id)?)?)
    }

    fn get_sent_message_by_short_id(&self, wanted: &str) -> Result<SentMessage, StoreError> {
        let mut matches = self
            .list_sent_messages()?
            .into_iter()
            .filter(|message| message.short_id == wanted);
        let first = matches.next().ok_or(StoreError::NotFound)?;
        if matches.next().is_some() {
            return Err(StoreError::AmbiguousId);
        }
        Ok(first)
    }

    fn list_sent_messages(&self) -> Result<Vec<SentMessage>, StoreError> {
        self.list("sent_messages")?
            .iter()
            .map(|value| serde_json::from_str(value).map_err(StoreError::from))
            .collect()
    }

    fn delete_sent_message(&self, id: &str) -> Result<(), StoreError> {
        self.delete("sent_messages", id)
    }

    fn reserve_slot(&self, slot: DateTime<Utc>, owner: &str) -> Result<bool, StoreError> {
        self.guard_writable()?;
        let key = slot.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO slots (id, value) VALUES (?1, ?2)",
            params![key, serde_json::to_string(owner)?],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn clear_all_slots(&self) -> Result<(), StoreError> {
        self.guard_writable()?;
        let conn = self.connect()?;
        conn.execute("DELETE FROM slots", [])?;
        Ok(())
    }

    fn add_scheduled_call(&self, call: &ScheduledCall) -> Result<(), StoreError> {
        let mut call = call.clone();
        call.short_id = short_id(&call.id);
        self.put(
            "scheduled_calls",
            &call.id,
            &serde_json::to_string(&call)?,
        )
    }

    fn get_scheduled_call(&self, id: &str) -> Result<ScheduledCall, StoreError> {
        Ok(serde_json::from_str(&self.get("scheduled_calls", id)?)?)
    }

    fn get_scheduled_call_by_short_id(&self, wanted: &str) -> Result<ScheduledCall, StoreError> {
        let mut matches = self
            .list_scheduled_calls()?
            .into_iter()
            .filter(|call| call.short_id == wanted);
        let first = matches.next().ok_or(StoreError::NotFound)?;
        if matches.next().is_some() {
            return Err(StoreError::AmbiguousId);
        }
        Ok(first)
    }

    fn list_scheduled_calls(&self) -> Result<Vec<ScheduledCall>, StoreError> {
        self.list("scheduled_calls")?
            .iter()
            .map(|value| serde_json::from_str(value).map_err(StoreError::from))
            .collect()
    }

    fn delete_scheduled_call(&self, id: &str) -> Result<(), StoreError> {
        self.delete("scheduled_calls", id)
    }

    fn clear_scheduled_calls(&self) -> Result<(), StoreError> {
        self.guard_writable()?;
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM scheduled_calls", [])?;
        tx.commit()?;
        Ok(())
    }

    fn get_schema_version(&self) -> Result<i64, StoreError> {
        match self.get("meta", "schema_version") {
            Ok(value) => Ok(serde_json::from_str(&value)?),
            Err(StoreError::NotFound) => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn set_schema_version(&self, version: i64) -> Result<(), StoreError> {
        self.put("meta", "schema_version", &serde_json::to_string(&version)?)
    }

    fn close(&self) -> Result<(), StoreError> {
        // Connections are opened per operation; nothing is held open.
        Ok(())
    }
}
