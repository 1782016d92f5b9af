use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::Call;

pub mod document;
pub mod embedded;

/// Delivery status of a sent message. `failed` may later be overwritten by
/// `sent`; `sent` may transition to `deleted`; `skipped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Sent,
    Failed,
    Deleted,
    Skipped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Status::Sent => "sent",
            Status::Failed => "failed",
            Status::Deleted => "deleted",
            Status::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// The durable log entry for one attempted delivery to one recipient.
///
/// `id` is `<campaignId>@<callId>@<destType>@<destination>`, so at most one
/// record exists per (campaign, call, destination type, recipient). The
/// store derives `id` and `short_id` on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub source_id: String,
    pub scheduled_at: DateTime<Utc>,
    /// Transport-returned message handle (for example the Slack `ts`),
    /// used for later deletion.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: Status,
    pub campaign_name: String,
}

/// A call that has been expanded into a concrete `(call, destination, time)`
/// instance and persisted until dispatched. `id` is a deterministic function
/// of the call, trigger, occurrence, and destination, so re-expansion over
/// identical inputs produces identical ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub call: Call,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("ambiguous id")]
    AmbiguousId,
    #[error("store is read-only")]
    ReadOnly,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("db operation failed: {0}")]
    Operation(String),
}

/// Generate the eight-character short id for a full id.
pub fn short_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Compose the sent-message primary key.
pub fn sent_message_id(campaign_id: &str, call_id: &str, kind: &str, destination: &str) -> String {
    [campaign_id, call_id, kind, destination].join("@")
}

/// Durable storage for the schedule, the sent-message log, slot
/// reservations, and the schema version.
pub trait Storer: Send + Sync {
    fn add_sent_message(
        &self,
        campaign_id: &str,
        call_id: &str,
        message: &SentMessage,
    ) -> Result<(), StoreError>;
    fn update_sent_message(&self, message: &SentMessage) -> Result<(), StoreError>;
    /// True iff a prior record exists with status sent, deleted, or
    /// skipped. A prior `failed` does not block retry.
    fn has_been_sent(
        &self,
        campaign_id: &str,
        call_id: &str,
        kind: &str,
        destination: &str,
    ) -> Result<bool, StoreError>;
    fn get_sent_message(&self, id: &str) -> Result<SentMessage, StoreError>;
    fn get_sent_message_by_short_id(&self, short_id: &str) -> Result<SentMessage, StoreError>;
    fn list_sent_messages(&self) -> Result<Vec<SentMessage>, StoreError>;
    fn delete_sent_message(&self, id: &str) -> Result<(), StoreError>;

    /// Atomically reserve a slot: true if this call inserted the
    /// reservation, false if the slot was already taken.
    fn reserve_slot(&self, slot: DateTime<Utc>, owner: &str) -> Result<bool, StoreError>;
    fn clear_all_slots(&self) -> Result<(), StoreError>;

    fn add_scheduled_call(&self, call: &ScheduledCall) -> Result<(), StoreError>;
    fn get_scheduled_call(&self, id: &str) -> Result<ScheduledCall, StoreError>;
    fn get_scheduled_call_by_short_id(&self, short_id: &str) -> Result<ScheduledCall, StoreError>;
    fn list_scheduled_calls(&self) -> Result<Vec<ScheduledCall>, StoreError>;
    fn delete_scheduled_call(&self, id: &str) -> Result<(), StoreError>;
    fn clear_scheduled_calls(&self) -> Result<(), StoreError>;

    fn get_schema_version(&self) -> Result<i64, StoreError>;
    fn set_schema_version(&self, version: i64) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}
