//! Rewrite of v0 call documents into the `triggers[]` authoring form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Call, Campaign, Destination, Event, Source, Trigger};

/// The pre-trigger authoring shape: scheduling fields sat directly on the
/// call.
#[derive(Debug, Deserialize)]
struct LegacyCall {
    id: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    destinations: Vec<Destination>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    recurring: bool,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    sequence: Option<String>,
    #[serde(default)]
    data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LegacySource {
    #[serde(default)]
    campaign: Campaign,
    #[serde(default)]
    calls: Vec<LegacyCall>,
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Serialize)]
struct MigratedSource {
    campaign: Campaign,
    calls: Vec<Call>,
    events: Vec<Event>,
}

/// Convert a v0 document to the current format and return it as YAML.
pub fn migrate_source_document(data: &str) -> Result<String, serde_yaml::Error> {
    let legacy: LegacySource = serde_yaml::from_str(data)?;

    let calls = legacy
        .calls
        .into_iter()
        .map(|call| {
            let mut triggers = Vec::new();
            if let Some(scheduled_at) = call.scheduled_at {
                triggers.push(Trigger {
                    scheduled_at: Some(scheduled_at),
                    ..Trigger::default()
                });
            }
            if let Some(cron) = call.cron {
                triggers.push(Trigger {
                    cron: Some(cron),
                    ..Trigger::default()
                });
            }
            if call.sequence.is_some() || call.delta.is_some() {
                triggers.push(Trigger {
                    sequence: call.sequence,
                    delta: call.delta,
                    ..Trigger::default()
                });
            }
            Call {
                id: call.id,
                author: call.author,
                subject: call.subject,
                content: call.content,
                destinations: call.destinations,
                triggers,
                data: call.data,
                campaign: Campaign::default(),
            }
        })
        .collect();

    serde_yaml::to_string(&MigratedSource {
        campaign: legacy.campaign,
        calls,
        events: legacy.events,
    })
}
