use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use super::{process_call, Worker};
use crate::clients::email::{EmailClient, EmailError};
use crate::clients::slack::{SlackClient, SlackError};
use crate::config::{AppConfig, SlotsConfig};
use crate::kv::embedded::EmbeddedStore;
use crate::kv::{ScheduledCall, SentMessage, Status, Storer};
use crate::model::{Call, Campaign, Destination};
use crate::poller::Poller;
use crate::scheduler::Scheduler;
use crate::sourcer::{Fetcher, SourceError, Sourcer, YamlParser};

#[derive(Default)]
struct MockSlack {
    fail: AtomicBool,
    posts: Mutex<Vec<(String, String, String)>>,
    notifications: Mutex<Vec<String>>,
}

#[async_trait]
impl SlackClient for MockSlack {
    async fn post_message(
        &self,
        destination: &str,
        _author: Option<&str>,
        subject: &str,
        content: &str,
        _campaign: &Campaign,
    ) -> Result<(String, String), SlackError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SlackError::Api("transient failure".to_string()));
        }
        self.posts.lock().unwrap().push((
            destination.to_string(),
            subject.to_string(),
            content.to_string(),
        ));
        Ok(("C1234567890".to_string(), "1700000000.000100".to_string()))
    }

    async fn notify_author(
        &self,
        author_email: &str,
        _channel_id: &str,
        _message_ts: &str,
        _channel_name: &str,
    ) -> Result<(), SlackError> {
        self.notifications
            .lock()
            .unwrap()
            .push(author_email.to_string());
        Ok(())
    }

    async fn delete_message(&self, _destination: &str, _ts: &str) -> Result<(), SlackError> {
        Ok(())
    }
}

#[derive(Default)]
struct MockEmail {
    sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl EmailClient for MockEmail {
    async fn send(
        &self,
        to: &[String],
        _author: Option<&str>,
        subject: &str,
        body: &str,
        _campaign: &Campaign,
    ) -> Result<(), EmailError> {
        for recipient in to {
            self.sent.lock().unwrap().push((
                recipient.clone(),
                subject.to_string(),
                body.to_string(),
            ));
        }
        Ok(())
    }
}

struct DeadFetcher;

#[async_trait]
impl Fetcher for DeadFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), SourceError> {
        Err(SourceError::Fetch {
            url: url.to_string(),
            reason: "unused in tests".to_string(),
        })
    }
}

fn scheduled(id: &str, kind: &str, to: &str, offset: chrono::Duration) -> ScheduledCall {
    ScheduledCall {
        id: id.to_string(),
        short_id: String::new(),
        call: Call {
            id: "hello".to_string(),
            subject: "Hi {{ name }}".to_string(),
            content: "Hello **{{ name }}**".to_string(),
            destinations: vec![Destination::single(kind, to)],
            data: [(
                "name".to_string(),
                serde_json::Value::String("Ada".to_string()),
            )]
            .into_iter()
            .collect(),
            campaign: Campaign {
                id: "launch".to_string(),
                name: "Launch".to_string(),
                icon_url: None,
            },
            ..Call::default()
        },
        scheduled_at: Utc::now() + offset,
    }
}

struct Fixture {
    store: Arc<EmbeddedStore>,
    slack: Arc<MockSlack>,
    email: Arc<MockEmail>,
    worker: Worker,
    _dir: TempDir,
}

fn fixture(dry_run: bool) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(EmbeddedStore::open(dir.path().join("callout.db")).expect("store"));
    let slack = Arc::new(MockSlack::default());
    let email = Arc::new(MockEmail::default());

    let mut config = AppConfig::default();
    config.dispatcher.dry_run = dry_run;
    config.worker.missed_lookback = Duration::from_secs(60 * 60);

    let worker = Worker::new(
        store.clone(),
        slack.clone(),
        email.clone(),
        Poller::new(Sourcer::new(
            Box::new(DeadFetcher),
            Box::new(YamlParser::new()),
        )),
        Scheduler::new(store.clone(), SlotsConfig::default()),
        &config,
    );

    Fixture {
        store,
        slack,
        email,
        worker,
        _dir: dir,
    }
}

#[tokio::test]
async fn dispatch_renders_and_records_sent() {
    let fixture = fixture(false);
    let scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");

    let posts = fixture.slack.posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    let (to, subject, content) = &posts[0];
    assert_eq!(to, "#general");
    assert_eq!(subject, "Hi Ada");
    assert_eq!(content, "Hello *Ada*");
    drop(posts);

    let record = fixture
        .store
        .get_sent_message("launch@hello@slack@#general")
        .expect("record");
    assert_eq!(record.status, Status::Sent);
    assert_eq!(record.timestamp, "1700000000.000100");

    // The schedule entry is consumed.
    assert!(fixture
        .store
        .list_scheduled_calls()
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn email_destinations_render_to_html() {
    let fixture = fixture(false);
    let scheduled = scheduled("id-1", "email", "u@example.com", chrono::Duration::minutes(-1));
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");

    let sent = fixture.email.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (to, subject, body) = &sent[0];
    assert_eq!(to, "u@example.com");
    assert_eq!(subject, "Hi Ada");
    assert!(body.contains("<strong>Ada</strong>"), "body: {body}");
}

#[tokio::test]
async fn failed_dispatch_is_retried_after_reemission() {
    let fixture = fixture(false);
    let scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));

    // First tick: the transport fails; the failure is recorded and the
    // schedule entry is consumed.
    fixture.slack.fail.store(true, Ordering::SeqCst);
    fixture.store.add_scheduled_call(&scheduled).expect("add");
    fixture.worker.process_messages().await.expect("tick");

    let record = fixture
        .store
        .get_sent_message("launch@hello@slack@#general")
        .expect("record");
    assert_eq!(record.status, Status::Failed);
    assert!(fixture
        .store
        .list_scheduled_calls()
        .expect("list")
        .is_empty());

    // The next refresh re-emits the identical instance; a failed record
    // does not block the retry.
    fixture.slack.fail.store(false, Ordering::SeqCst);
    fixture.store.add_scheduled_call(&scheduled).expect("re-add");
    fixture.worker.process_messages().await.expect("tick");

    let record = fixture
        .store
        .get_sent_message("launch@hello@slack@#general")
        .expect("record");
    assert_eq!(record.status, Status::Sent);
    assert_eq!(fixture.slack.posts.lock().unwrap().len(), 1);
    assert_eq!(fixture.store.list_sent_messages().expect("list").len(), 1);
}

#[tokio::test]
async fn already_sent_calls_are_skipped_but_consumed() {
    let fixture = fixture(false);
    let scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));

    let prior = SentMessage {
        id: String::new(),
        short_id: String::new(),
        source_id: "hello".to_string(),
        scheduled_at: scheduled.scheduled_at,
        timestamp: "1.0".to_string(),
        destination: "#general".to_string(),
        kind: "slack".to_string(),
        status: Status::Sent,
        campaign_name: "Launch".to_string(),
    };
    fixture
        .store
        .add_sent_message("launch", "hello", &prior)
        .expect("seed");

    fixture.store.add_scheduled_call(&scheduled).expect("add");
    fixture.worker.process_messages().await.expect("tick");

    assert!(fixture.slack.posts.lock().unwrap().is_empty());
    assert!(fixture
        .store
        .list_scheduled_calls()
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn skipped_status_blocks_dispatch() {
    let fixture = fixture(false);
    let scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));
    let prior = SentMessage {
        id: String::new(),
        short_id: String::new(),
        source_id: "hello".to_string(),
        scheduled_at: scheduled.scheduled_at,
        timestamp: String::new(),
        destination: "#general".to_string(),
        kind: "slack".to_string(),
        status: Status::Skipped,
        campaign_name: "Launch".to_string(),
    };
    fixture
        .store
        .add_sent_message("launch", "hello", &prior)
        .expect("seed");
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");
    assert!(fixture.slack.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn calls_outside_lookback_are_recorded_as_failed_without_transport() {
    let fixture = fixture(false);
    let scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::hours(-2));
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");

    assert!(fixture.slack.posts.lock().unwrap().is_empty());
    let record = fixture
        .store
        .get_sent_message("launch@hello@slack@#general")
        .expect("record");
    assert_eq!(record.status, Status::Failed);
    assert!(fixture
        .store
        .list_scheduled_calls()
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn future_calls_stay_scheduled() {
    let fixture = fixture(false);
    let scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::hours(1));
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");

    assert!(fixture.slack.posts.lock().unwrap().is_empty());
    assert_eq!(fixture.store.list_scheduled_calls().expect("list").len(), 1);
    assert!(fixture.store.list_sent_messages().expect("list").is_empty());
}

#[tokio::test]
async fn dry_run_neither_sends_nor_records() {
    let fixture = fixture(true);
    let scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");

    assert!(fixture.slack.posts.lock().unwrap().is_empty());
    assert!(fixture.store.list_sent_messages().expect("list").is_empty());
    // The entry is still consumed so the tick does not spin on it.
    assert!(fixture
        .store
        .list_scheduled_calls()
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn render_errors_record_failed_without_transport() {
    let fixture = fixture(false);
    let mut scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));
    scheduled.call.content = "{{ unclosed".to_string();
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");

    assert!(fixture.slack.posts.lock().unwrap().is_empty());
    let record = fixture
        .store
        .get_sent_message("launch@hello@slack@#general")
        .expect("record");
    assert_eq!(record.status, Status::Failed);
}

#[tokio::test]
async fn author_is_notified_after_successful_slack_send() {
    let fixture = fixture(false);
    let mut scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));
    scheduled.call.author = Some("ada@example.com".to_string());
    fixture.store.add_scheduled_call(&scheduled).expect("add");

    fixture.worker.process_messages().await.expect("tick");

    assert_eq!(
        *fixture.slack.notifications.lock().unwrap(),
        vec!["ada@example.com".to_string()]
    );
}

#[tokio::test]
async fn process_call_ignores_calls_without_recipients() {
    let fixture = fixture(false);
    let mut scheduled = scheduled("id-1", "slack", "#general", chrono::Duration::minutes(-1));
    scheduled.call.destinations = vec![Destination {
        kind: "slack".to_string(),
        to: vec![],
    }];

    process_call(
        &scheduled,
        fixture.store.as_ref(),
        fixture.slack.as_ref(),
        fixture.email.as_ref(),
        false,
    )
    .await
    .expect("process");
    assert!(fixture.slack.posts.lock().unwrap().is_empty());
    assert!(fixture.store.list_sent_messages().expect("list").is_empty());
}
