use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A campaign groups calls for display and transport attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

impl Campaign {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.name.is_empty() && self.icon_url.is_none()
    }
}

/// A destination a call is delivered to. `kind` selects the transport
/// ("slack" or "email"); each entry in `to` is one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub to: Vec<String>,
}

impl Destination {
    pub fn single(kind: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            to: vec![to.into()],
        }
    }
}

/// A scheduling mechanism for a call. Authored as a single mapping where
/// any of the shapes may be present; the scheduler enumerates every shape
/// that is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rrule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dstart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hijri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

/// A declarative message definition: content, destinations, and the
/// triggers that say when it fires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
    /// Stamped by the parser from the source header; never authored on the
    /// call itself.
    #[serde(default, skip_serializing_if = "Campaign::is_empty")]
    pub campaign: Campaign,
}

/// A named instant to which delta-offset triggers bind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// One parsed source document: a campaign header plus its calls and events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub campaign: Campaign,
    #[serde(default)]
    pub calls: Vec<Call>,
    #[serde(default)]
    pub events: Vec<Event>,
}
