//! Cloud document-DB backend.
//!
//! The same four containers as the embedded store, held as JSONB document
//! tables behind a connection pool. Multiple readers are safe; the slot
//! reservation is an optimistic insert keyed on document existence.

use chrono::{DateTime, SecondsFormat, Utc};
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::error;

use super::{sent_message_id, short_id, ScheduledCall, SentMessage, Status, StoreError, Storer};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sent_messages (
    id TEXT PRIMARY KEY,
    value JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS scheduled_calls (
    id TEXT PRIMARY KEY,
    value JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS slots (
    id TEXT PRIMARY KEY,
    value JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    id TEXT PRIMARY KEY,
    value JSONB NOT NULL
);
"#;

#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("document store pool error: {:?}", err);
    }
}

pub struct DocumentStore {
    pool: Pool<PostgresConnectionManager<MakeTlsConnector>>,
}

impl DocumentStore {
    pub fn connect(db_url: &str) -> Result<Self, StoreError> {
        let config: postgres::Config = db_url
            .parse()
            .map_err(|err: postgres::Error| StoreError::Operation(err.to_string()))?;
        let connector = native_tls::TlsConnector::new()
            .map_err(|err| StoreError::Operation(err.to_string()))?;
        let tls = MakeTlsConnector::new(connector);
        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(std::time::Duration::from_secs(5))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;

        let store = Self { pool };
        store.conn()?.batch_execute(SCHEMA)?;
        Ok(store)
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn put(&self, table: &str, id: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (id, value) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET value = EXCLUDED.value"
            ),
            &[&id, value],
        )?;
        Ok(())
    }

    fn get(&self, table: &str, id: &str) -> Result<serde_json::Value, StoreError> {
        let mut conn = self.conn()?;
        let row = conn
            .query_opt(&format!("SELECT value FROM {table} WHERE id = $1"), &[&id])?
            .ok_or(StoreError::NotFound)?;
        Ok(row.get(0))
    }

    fn list(&self, table: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        let mut conn = self.conn()?;
        let rows = conn.query(&format!("SELECT value FROM {table} ORDER BY id"), &[])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.execute(&format!("DELETE FROM {table} WHERE id = $1"), &[&id])?;
        Ok(())
    }
}

impl Storer for DocumentStore {
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
            &serde_json::to_value(&message)?,
        )
    }

    fn update_sent_message(&self, message: &SentMessage) -> Result<(), StoreError> {
        self.put("sent_messages", &message.id, &serde_json::to_value(message)?)
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
                let message: SentMessage = serde_json::from_value(value)?;
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
        Ok(serde_json::from_value(self.get("sent_messages", id)?)?)
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
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }

    fn delete_sent_message(&self, id: &str) -> Result<(), StoreError> {
        self.delete("sent_messages", id)
    }

    fn reserve_slot(&self, slot: DateTime<Utc>, owner: &str) -> Result<bool, StoreError> {
        let key = slot.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO slots (id, value) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
            &[&key, &serde_json::Value::String(owner.to_string())],
        )?;
        Ok(inserted == 1)
    }

    fn clear_all_slots(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.execute("DELETE FROM slots", &[])?;
        Ok(())
    }

    fn add_scheduled_call(&self, call: &ScheduledCall) -> Result<(), StoreError> {
        let mut call = call.clone();
        call.short_id = short_id(&call.id);
        self.put(
            "scheduled_calls",
            &call.id,
            &serde_json::to_value(&call)?,
        )
    }

    fn get_scheduled_call(&self, id: &str) -> Result<ScheduledCall, StoreError> {
        Ok(serde_json::from_value(self.get("scheduled_calls", id)?)?)
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
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }

    fn delete_scheduled_call(&self, id: &str) -> Result<(), StoreError> {
        self.delete("scheduled_calls", id)
    }

    fn clear_scheduled_calls(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.execute("DELETE FROM scheduled_calls", &[])?;
        Ok(())
    }

    fn get_schema_version(&self) -> Result<i64, StoreError> {
        match self.get("meta", "schema_version") {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(StoreError::NotFound) => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn set_schema_version(&self, version: i64) -> Result<(), StoreError> {
        self.put("meta", "schema_version", &serde_json::to_value(version)?)
    }

    fn close(&self) -> Result<(), StoreError> {
        // The pool drops connections when the store is dropped.
        Ok(())
    }
}
