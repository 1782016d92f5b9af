use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use super::Scheduler;
use crate::config::SlotsConfig;
use crate::kv::embedded::EmbeddedStore;
use crate::kv::Storer;
use crate::model::{Call, Campaign, Destination, Event, Source, Trigger};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

const SLOTS: &str = r#"
timezone: UTC
default:
  sunday: ["10:00", "16:00"]
slack:
  default:
    sunday: ["11:00"]
"#;

fn store_in(dir: &TempDir) -> Arc<dyn Storer> {
    Arc::new(EmbeddedStore::open(dir.path().join("callout.db")).expect("open store"))
}

fn scheduler(store: Arc<dyn Storer>, slots: &str) -> Scheduler {
    let slots: SlotsConfig = if slots.is_empty() {
        SlotsConfig::default()
    } else {
        serde_yaml::from_str(slots).expect("parse slots")
    };
    Scheduler::new(store, slots)
}

fn call(id: &str, destinations: Vec<Destination>, triggers: Vec<Trigger>) -> Call {
    Call {
        id: id.to_string(),
        subject: "Subject".to_string(),
        content: "Content".to_string(),
        destinations,
        triggers,
        campaign: Campaign {
            id: "launch".to_string(),
            name: "Launch".to_string(),
            icon_url: None,
        },
        ..Call::default()
    }
}

fn source(calls: Vec<Call>, events: Vec<Event>) -> Source {
    Source {
        campaign: Campaign {
            id: "launch".to_string(),
            name: "Launch".to_string(),
            icon_url: None,
        },
        calls,
        events,
    }
}

fn at(spec: &str) -> DateTime<Utc> {
    spec.parse().expect("timestamp")
}

#[test]
fn absolute_midnight_is_rewritten_onto_slots_per_destination() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), SLOTS);

    let sources = vec![source(
        vec![call(
            "hello",
            vec![
                Destination::single("email", "u@x"),
                Destination::single("slack", "#g"),
            ],
            vec![Trigger {
                scheduled_at: Some(at("2023-01-01T00:00:00Z")),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    // 2023-01-01 is a Sunday.
    let now = at("2023-01-01T08:00:00Z");
    let expanded = scheduler.expand(&sources, now, HOUR, DAY).expect("expand");

    assert_eq!(expanded.len(), 2);
    assert_eq!(expanded[0].call.destinations[0].kind, "email");
    assert_eq!(expanded[0].scheduled_at, at("2023-01-01T10:00:00Z"));
    assert_eq!(expanded[1].call.destinations[0].kind, "slack");
    assert_eq!(expanded[1].scheduled_at, at("2023-01-01T11:00:00Z"));
}

#[test]
fn absolute_midnight_without_slot_config_emits_verbatim() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "hello",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                scheduled_at: Some(at("2023-01-01T00:00:00Z")),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(&sources, at("2023-01-01T08:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].scheduled_at, at("2023-01-01T00:00:00Z"));
}

#[test]
fn absolute_with_time_outside_window_is_dropped() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "hello",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                scheduled_at: Some(at("2023-01-05T09:30:00Z")),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(&sources, at("2023-01-01T08:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert!(expanded.is_empty());
}

#[test]
fn cron_emits_every_occurrence_in_window() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), SLOTS);

    let sources = vec![source(
        vec![call(
            "daily",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                cron: Some("0 14 * * *".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(&sources, at("2023-01-01T08:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].scheduled_at, at("2023-01-01T14:00:00Z"));
    assert_eq!(
        expanded[0].id,
        "daily:cron:0 14 * * *:2023-01-01T14:00:00Z:slack:#g"
    );

    // Widen the window and a second firing appears.
    let expanded = scheduler
        .expand(
            &sources,
            at("2023-01-01T08:00:00Z"),
            HOUR,
            Duration::from_secs(48 * 60 * 60),
        )
        .expect("expand");
    assert_eq!(expanded.len(), 2);
    assert_eq!(expanded[1].scheduled_at, at("2023-01-02T14:00:00Z"));
}

#[test]
fn cron_window_end_is_exclusive_and_start_inclusive() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "morning",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                cron: Some("0 8 * * *".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    // Next firing is exactly now + after: not emitted.
    let expanded = scheduler
        .expand(
            &sources,
            at("2023-01-01T08:30:00Z"),
            Duration::from_secs(10 * 60),
            Duration::from_secs(23 * 60 * 60 + 30 * 60),
        )
        .expect("expand");
    assert!(expanded.is_empty());

    // A firing exactly on the window start is emitted.
    let sources = vec![source(
        vec![call(
            "morning",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                cron: Some("30 8 * * *".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];
    let expanded = scheduler
        .expand(
            &sources,
            at("2023-01-01T08:40:00Z"),
            Duration::from_secs(10 * 60),
            DAY,
        )
        .expect("expand");
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].scheduled_at, at("2023-01-01T08:30:00Z"));
}

#[test]
fn event_sequence_merges_event_destinations() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let event = Event {
        sequence: "launch".to_string(),
        start_time: at("2025-01-01T12:00:00Z"),
        destinations: vec![Destination::single("email", "all@x")],
    };
    let sources = vec![source(
        vec![
            call(
                "a",
                vec![Destination::single("slack", "#general")],
                vec![Trigger {
                    sequence: Some("launch".to_string()),
                    delta: Some("5m".to_string()),
                    ..Trigger::default()
                }],
            ),
            call(
                "b",
                vec![Destination::single("slack", "#marketing")],
                vec![Trigger {
                    sequence: Some("launch".to_string()),
                    delta: Some("1h".to_string()),
                    ..Trigger::default()
                }],
            ),
        ],
        vec![event],
    )];

    let expanded = scheduler
        .expand(&sources, at("2025-01-01T11:30:00Z"), HOUR, DAY)
        .expect("expand");

    let summary: Vec<(String, String, DateTime<Utc>)> = expanded
        .iter()
        .map(|instance| {
            (
                instance.call.destinations[0].kind.clone(),
                instance.call.destinations[0].to[0].clone(),
                instance.scheduled_at,
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (
                "slack".to_string(),
                "#general".to_string(),
                at("2025-01-01T12:05:00Z")
            ),
            (
                "email".to_string(),
                "all@x".to_string(),
                at("2025-01-01T12:05:00Z")
            ),
            (
                "slack".to_string(),
                "#marketing".to_string(),
                at("2025-01-01T13:00:00Z")
            ),
            (
                "email".to_string(),
                "all@x".to_string(),
                at("2025-01-01T13:00:00Z")
            ),
        ]
    );
}

#[test]
fn event_sequence_dedupes_repeated_recipients() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let event = Event {
        sequence: "launch".to_string(),
        start_time: at("2025-01-01T12:00:00Z"),
        destinations: vec![Destination {
            kind: "slack".to_string(),
            to: vec!["#general".to_string(), "#extra".to_string()],
        }],
    };
    let sources = vec![source(
        vec![call(
            "a",
            vec![Destination::single("slack", "#general")],
            vec![Trigger {
                sequence: Some("launch".to_string()),
                delta: Some("5m".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![event],
    )];

    let expanded = scheduler
        .expand(&sources, at("2025-01-01T11:30:00Z"), HOUR, DAY)
        .expect("expand");
    let recipients: Vec<&str> = expanded
        .iter()
        .map(|instance| instance.call.destinations[0].to[0].as_str())
        .collect();
    assert_eq!(recipients, vec!["#general", "#extra"]);
}

#[test]
fn sequence_without_matching_event_emits_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "a",
            vec![Destination::single("slack", "#general")],
            vec![Trigger {
                sequence: Some("missing".to_string()),
                delta: Some("5m".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];
    let expanded = scheduler
        .expand(&sources, at("2025-01-01T11:30:00Z"), HOUR, DAY)
        .expect("expand");
    assert!(expanded.is_empty());
}

#[test]
fn hijri_resolves_next_forward_occurrence() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "new-year",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                hijri: Some("1 Muharram".to_string()),
                time: Some("10:00".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(
            &sources,
            at("2024-08-01T00:00:00Z"),
            HOUR,
            Duration::from_secs(400 * 24 * 60 * 60),
        )
        .expect("expand");
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].scheduled_at, at("2025-06-27T10:00:00Z"));

    // Out of window: nothing is emitted.
    let expanded = scheduler
        .expand(&sources, at("2024-08-01T00:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert!(expanded.is_empty());
}

#[test]
fn rrule_defaults_to_midnight_of_today_without_time_parts() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "daily",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                rrule: Some("FREQ=DAILY;COUNT=5".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(
            &sources,
            at("2023-01-01T08:00:00Z"),
            HOUR,
            Duration::from_secs(48 * 60 * 60),
        )
        .expect("expand");
    let times: Vec<DateTime<Utc>> = expanded
        .iter()
        .map(|instance| instance.scheduled_at)
        .collect();
    assert_eq!(
        times,
        vec![at("2023-01-02T00:00:00Z"), at("2023-01-03T00:00:00Z")]
    );
}

#[test]
fn rrule_uses_now_when_rule_carries_time_parts() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "daily",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                rrule: Some("FREQ=DAILY;BYHOUR=9;BYMINUTE=0;BYSECOND=0".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(&sources, at("2023-01-01T08:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].scheduled_at, at("2023-01-01T09:00:00Z"));
}

#[test]
fn rrule_dstart_is_resolved_in_its_timezone() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "daily",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                rrule: Some("FREQ=DAILY;COUNT=2".to_string()),
                dstart: Some("TZID=Europe/Berlin:20230101T090000".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(
            &sources,
            at("2023-01-01T07:00:00Z"),
            HOUR,
            Duration::from_secs(48 * 60 * 60),
        )
        .expect("expand");
    let times: Vec<DateTime<Utc>> = expanded
        .iter()
        .map(|instance| instance.scheduled_at)
        .collect();
    // 09:00 Berlin is 08:00 UTC in January.
    assert_eq!(
        times,
        vec![at("2023-01-01T08:00:00Z"), at("2023-01-02T08:00:00Z")]
    );
}

#[test]
fn multi_recipient_destinations_fan_out() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![call(
            "hello",
            vec![Destination {
                kind: "slack".to_string(),
                to: vec!["#a".to_string(), "#b".to_string()],
            }],
            vec![Trigger {
                scheduled_at: Some(at("2023-01-01T09:30:00Z")),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(&sources, at("2023-01-01T08:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert_eq!(expanded.len(), 2);
    for instance in &expanded {
        assert_eq!(instance.call.destinations.len(), 1);
        assert_eq!(instance.call.destinations[0].to.len(), 1);
    }
    assert_eq!(expanded[0].id, "hello:scheduled_at:2023-01-01T09:30:00Z:slack:#a");
    assert_eq!(expanded[1].id, "hello:scheduled_at:2023-01-01T09:30:00Z:slack:#b");
}

#[test]
fn same_destination_slot_times_strictly_increase() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(
        store_in(&dir),
        "timezone: UTC\ndefault:\n  sunday: [\"10:00\"]\n",
    );

    // Two midnight triggers for the same destination: the second rolls over
    // to the following Sunday because the first took the only slot.
    let sources = vec![source(
        vec![call(
            "hello",
            vec![Destination::single("slack", "#g")],
            vec![
                Trigger {
                    scheduled_at: Some(at("2023-01-01T00:00:00Z")),
                    ..Trigger::default()
                },
                Trigger {
                    scheduled_at: Some(at("2023-01-01T00:00:00Z")),
                    ..Trigger::default()
                },
            ],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(
            &sources,
            at("2023-01-01T08:00:00Z"),
            HOUR,
            Duration::from_secs(14 * 24 * 60 * 60),
        )
        .expect("expand");
    assert_eq!(expanded.len(), 2);
    assert_eq!(expanded[0].scheduled_at, at("2023-01-01T10:00:00Z"));
    assert_eq!(expanded[1].scheduled_at, at("2023-01-08T10:00:00Z"));
    assert!(expanded[0].scheduled_at < expanded[1].scheduled_at);
}

#[test]
fn distinct_destinations_never_share_a_slot() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(
        store_in(&dir),
        "timezone: UTC\ndefault:\n  sunday: [\"10:00\", \"16:00\"]\n",
    );

    let sources = vec![source(
        vec![call(
            "hello",
            vec![
                Destination::single("email", "u@x"),
                Destination::single("slack", "#g"),
            ],
            vec![Trigger {
                scheduled_at: Some(at("2023-01-01T00:00:00Z")),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];

    let expanded = scheduler
        .expand(&sources, at("2023-01-01T08:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert_eq!(expanded.len(), 2);
    assert_ne!(expanded[0].scheduled_at, expanded[1].scheduled_at);
}

#[test]
fn expansion_is_deterministic_over_identical_inputs() {
    let sources = vec![source(
        vec![call(
            "hello",
            vec![
                Destination::single("email", "u@x"),
                Destination::single("slack", "#g"),
            ],
            vec![
                Trigger {
                    scheduled_at: Some(at("2023-01-01T00:00:00Z")),
                    ..Trigger::default()
                },
                Trigger {
                    cron: Some("0 14 * * *".to_string()),
                    ..Trigger::default()
                },
            ],
        )],
        vec![],
    )];
    let now = at("2023-01-01T08:00:00Z");

    let dir = TempDir::new().expect("tempdir");
    let scheduler_a = scheduler(store_in(&dir), SLOTS);
    let first = scheduler_a.expand(&sources, now, HOUR, DAY).expect("expand");
    // Expansion claims slots in memory over an empty grid, so a re-run
    // over the same inputs reproduces the same schedule.
    let second = scheduler_a.expand(&sources, now, HOUR, DAY).expect("expand");
    assert_eq!(first, second);

    let other = TempDir::new().expect("tempdir");
    let scheduler_b = scheduler(store_in(&other), SLOTS);
    let third = scheduler_b.expand(&sources, now, HOUR, DAY).expect("expand");
    assert_eq!(first, third);
}

#[test]
fn expand_never_writes_to_the_store() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("callout.db");
    // Create the database, then hand the scheduler a read-only handle: any
    // store write during expansion would error out.
    EmbeddedStore::open(&path).expect("create store");
    let store: Arc<dyn Storer> =
        Arc::new(EmbeddedStore::open_read_only(&path).expect("open read-only"));
    let scheduler = Scheduler::new(store.clone(), serde_yaml::from_str(SLOTS).expect("slots"));

    let sources = vec![source(
        vec![call(
            "hello",
            vec![
                Destination::single("email", "u@x"),
                Destination::single("slack", "#g"),
            ],
            vec![Trigger {
                scheduled_at: Some(at("2023-01-01T00:00:00Z")),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];
    let now = at("2023-01-01T08:00:00Z");

    let expanded = scheduler.expand(&sources, now, HOUR, DAY).expect("expand");
    assert_eq!(expanded.len(), 2);
    assert_eq!(expanded[0].scheduled_at, at("2023-01-01T10:00:00Z"));
    assert_eq!(expanded[1].scheduled_at, at("2023-01-01T11:00:00Z"));

    // Refresh does persist, so the read-only store rejects it.
    assert!(scheduler.refresh(&sources, now, HOUR, DAY).is_err());
}

#[test]
fn refresh_rewrites_the_persisted_schedule() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_in(&dir);
    let scheduler = scheduler(store.clone(), SLOTS);

    let sources = vec![source(
        vec![call(
            "hello",
            vec![Destination::single("slack", "#g")],
            vec![Trigger {
                cron: Some("0 14 * * *".to_string()),
                ..Trigger::default()
            }],
        )],
        vec![],
    )];
    let now = at("2023-01-01T08:00:00Z");

    scheduler.refresh(&sources, now, HOUR, DAY).expect("refresh");
    let first: Vec<String> = store
        .list_scheduled_calls()
        .expect("list")
        .into_iter()
        .map(|instance| instance.id)
        .collect();
    assert_eq!(first.len(), 1);

    // Unchanged sources: an empty delta.
    scheduler.refresh(&sources, now, HOUR, DAY).expect("refresh");
    let second: Vec<String> = store
        .list_scheduled_calls()
        .expect("list")
        .into_iter()
        .map(|instance| instance.id)
        .collect();
    assert_eq!(first, second);

    // Removing the source empties the schedule.
    scheduler.refresh(&[], now, HOUR, DAY).expect("refresh");
    assert!(store.list_scheduled_calls().expect("list").is_empty());
}

#[test]
fn bad_triggers_do_not_abort_the_rest_of_the_expansion() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let sources = vec![source(
        vec![
            call(
                "broken",
                vec![Destination::single("slack", "#g")],
                vec![
                    Trigger {
                        cron: Some("not a cron".to_string()),
                        ..Trigger::default()
                    },
                    Trigger {
                        rrule: Some("FREQ=NONSENSE".to_string()),
                        ..Trigger::default()
                    },
                    Trigger {
                        hijri: Some("99 Muharram".to_string()),
                        ..Trigger::default()
                    },
                    Trigger {
                        sequence: Some("launch".to_string()),
                        delta: Some("not a duration".to_string()),
                        ..Trigger::default()
                    },
                ],
            ),
            call(
                "good",
                vec![Destination::single("slack", "#g")],
                vec![Trigger {
                    cron: Some("0 14 * * *".to_string()),
                    ..Trigger::default()
                }],
            ),
        ],
        vec![Event {
            sequence: "launch".to_string(),
            start_time: at("2023-01-01T12:00:00Z"),
            destinations: vec![],
        }],
    )];

    let expanded = scheduler
        .expand(&sources, at("2023-01-01T08:00:00Z"), HOUR, DAY)
        .expect("expand");
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].call.id, "good");
}

#[test]
fn every_emitted_time_lies_in_the_window() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let now = at("2023-01-01T08:00:00Z");
    let sources = vec![source(
        vec![call(
            "mixed",
            vec![Destination::single("slack", "#g")],
            vec![
                Trigger {
                    cron: Some("0 */2 * * *".to_string()),
                    ..Trigger::default()
                },
                Trigger {
                    rrule: Some("FREQ=HOURLY;COUNT=100".to_string()),
                    dstart: Some("20230101T063000".to_string()),
                    ..Trigger::default()
                },
                Trigger {
                    scheduled_at: Some(at("2023-01-01T09:15:00Z")),
                    ..Trigger::default()
                },
            ],
        )],
        vec![],
    )];

    let expanded = scheduler.expand(&sources, now, HOUR, DAY).expect("expand");
    assert!(!expanded.is_empty());
    let start = now - chrono::Duration::hours(1);
    let end = now + chrono::Duration::days(1);
    for instance in &expanded {
        assert!(
            instance.scheduled_at >= start && instance.scheduled_at < end,
            "{} at {} escapes the window",
            instance.id,
            instance.scheduled_at
        );
    }
}

#[test]
fn expanded_instances_default_the_campaign_name() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = scheduler(store_in(&dir), "");

    let mut anonymous = call(
        "hello",
        vec![Destination::single("slack", "#g")],
        vec![Trigger {
            scheduled_at: Some(at("2023-01-01T09:30:00Z")),
            ..Trigger::default()
        }],
    );
    anonymous.campaign = Campaign {
        id: "launch".to_string(),
        name: String::new(),
        icon_url: None,
    };

    let expanded = scheduler
        .expand(
            &[source(vec![anonymous], vec![])],
            at("2023-01-01T08:00:00Z"),
            HOUR,
            DAY,
        )
        .expect("expand");
    assert_eq!(expanded[0].call.campaign.name, "announcements");
    // Triggers never survive into the persisted instance.
    assert!(expanded[0].call.triggers.is_empty());
}
