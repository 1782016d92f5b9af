use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use callout::clients::email::{EmailClient, SmtpClient};
use callout::clients::slack::{ApiClient, SlackClient};
use callout::config::AppConfig;
use callout::kv::document::DocumentStore;
use callout::kv::embedded::EmbeddedStore;
use callout::kv::{sent_message_id, SentMessage, Status, StoreError, Storer};
use callout::migration::{migrate_source_document, MigrationRegistry};
use callout::poller::Poller;
use callout::processor::ProcessorStack;
use callout::scheduler::Scheduler;
use callout::sourcer::{build_sourcer, YamlParser, Parser as SourceParser};
use callout::worker::Worker;
use callout::{server, Source};

#[derive(Parser)]
#[command(name = "callout", version, about = "Schedules and dispatches declarative calls to Slack and email")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/callout/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watcher: poll sources, keep the schedule fresh, dispatch calls
    Watch,
    /// Poll, refresh, and dispatch once, then exit
    Run,
    /// Inspect and manage the persisted schedule
    #[command(subcommand)]
    Scheduled(ScheduledCommand),
    /// Inspect and manage the sent-message log
    #[command(subcommand)]
    Sent(SentCommand),
    /// Schema and document migrations
    #[command(subcommand)]
    Migrate(MigrateCommand),
    /// Render a call from a document the way the dispatcher would
    Render {
        /// Path to the call document
        file: PathBuf,
        /// Call id inside the document
        #[arg(long)]
        call: String,
        /// Destination type to render for
        #[arg(long, default_value = "slack")]
        kind: String,
    },
}

#[derive(Subcommand)]
enum ScheduledCommand {
    /// List the persisted schedule
    List,
    /// Poll sources and rebuild the schedule now
    Refresh,
    /// List calls that were scheduled in the past N days but have no
    /// successful delivery record
    Missed {
        #[arg(long, default_value_t = 14)]
        days: u64,
    },
    /// Mark a scheduled call as skipped so it will not be dispatched
    Skip { id: String },
}

#[derive(Subcommand)]
enum SentCommand {
    /// List the sent-message log
    List,
    /// Delete a sent message via its transport and mark the record deleted
    Delete { id: String },
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply pending datastore migrations
    Db,
    /// Rewrite a v0 call document into the triggers form (stdout)
    Source { file: PathBuf },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &AppConfig, read_only: bool) -> anyhow::Result<Arc<dyn Storer>> {
    match config.datastore.kind.as_str() {
        "embedded" => {
            let path = config
                .datastore
                .path
                .clone()
                .unwrap_or_else(EmbeddedStore::default_path);
            let store = if read_only {
                EmbeddedStore::open_read_only(&path)
            } else {
                EmbeddedStore::open(&path)
            }
            .with_context(|| format!("failed to open datastore at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        "cloud" => {
            let url = config
                .datastore
                .url
                .as_deref()
                .context("datastore.url is required for the cloud datastore")?;
            Ok(Arc::new(
                DocumentStore::connect(url).context("failed to connect to datastore")?,
            ))
        }
        other => bail!("unknown datastore type '{other}'"),
    }
}

fn slack_client(config: &AppConfig) -> Arc<dyn SlackClient> {
    Arc::new(ApiClient::new(
        config.slack.app.token.clone(),
        config.slack.api_url.as_deref(),
    ))
}

fn email_client(config: &AppConfig) -> anyhow::Result<Arc<dyn EmailClient>> {
    Ok(Arc::new(
        SmtpClient::new(
            &config.email.host,
            config.email.port,
            &config.email.username,
            &config.email.password,
            &config.email.from,
        )
        .context("failed to build smtp client")?,
    ))
}

fn build_poller(config: &AppConfig) -> Poller {
    Poller::new(build_sourcer(config.git.tokens.clone()))
}

fn build_worker(config: &AppConfig, store: Arc<dyn Storer>) -> anyhow::Result<Worker> {
    let scheduler = Scheduler::new(store.clone(), config.slots.clone());
    Ok(Worker::new(
        store,
        slack_client(config),
        email_client(config)?,
        build_poller(config),
        scheduler,
        config,
    ))
}

async fn poll_all_sources(config: &AppConfig) -> anyhow::Result<Vec<Source>> {
    if config.source.urls.is_empty() {
        bail!("no source URLs configured");
    }
    let mut poller = build_poller(config);
    Ok(poller.poll(&config.source.urls).await?)
}

fn fmt_time(instant: chrono::DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

async fn cmd_watch(config: AppConfig) -> anyhow::Result<()> {
    let port = config.watch.port;
    tokio::spawn(async move {
        if let Err(err) = server::serve(port).await {
            error!("healthz server failed: {}", err);
        }
    });

    let store = open_store(&config, false)?;
    let mut worker = build_worker(&config, store.clone())?;
    let result = worker.run().await;
    store.close()?;
    Ok(result?)
}

async fn cmd_run(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config, false)?;
    let mut worker = build_worker(&config, store.clone())?;
    let result = worker.run_once().await;
    store.close()?;
    Ok(result?)
}

fn cmd_scheduled_list(store: &dyn Storer) -> anyhow::Result<()> {
    let calls = store.list_scheduled_calls()?;
    if calls.is_empty() {
        println!("No scheduled calls.");
        return Ok(());
    }
    println!(
        "{:<10} {:<22} {:<7} {:<28} {}",
        "SHORT ID", "SCHEDULED AT", "TYPE", "DESTINATION", "CALL"
    );
    for call in calls {
        let destination = call.call.destinations.first();
        println!(
            "{:<10} {:<22} {:<7} {:<28} {}",
            call.short_id,
            fmt_time(call.scheduled_at),
            destination.map(|d| d.kind.as_str()).unwrap_or("-"),
            destination
                .and_then(|d| d.to.first())
                .map(String::as_str)
                .unwrap_or("-"),
            call.call.id,
        );
    }
    Ok(())
}

async fn cmd_scheduled_refresh(config: &AppConfig) -> anyhow::Result<()> {
    let sources = poll_all_sources(config).await?;
    let store = open_store(config, false)?;
    let scheduler = Scheduler::new(store.clone(), config.slots.clone());
    scheduler.refresh(
        &sources,
        Utc::now(),
        config.worker.calculation.before,
        config.worker.calculation.after,
    )?;
    let count = store.list_scheduled_calls()?.len();
    store.close()?;
    println!("schedule refreshed: {count} call(s)");
    Ok(())
}

async fn cmd_scheduled_missed(config: &AppConfig, days: u64) -> anyhow::Result<()> {
    let sources = poll_all_sources(config).await?;
    // Reporting only: expansion does not touch the store.
    let store = open_store(config, true)?;
    let scheduler = Scheduler::new(store.clone(), config.slots.clone());

    let now = Utc::now();
    let expanded = scheduler.expand(
        &sources,
        now,
        std::time::Duration::from_secs(days * 24 * 60 * 60),
        std::time::Duration::ZERO,
    )?;

    let mut missed = Vec::new();
    for instance in expanded {
        if instance.scheduled_at >= now {
            continue;
        }
        let destination = match instance.call.destinations.first() {
            Some(destination) => destination.clone(),
            None => continue,
        };
        let to = match destination.to.first() {
            Some(to) => to.clone(),
            None => continue,
        };
        let id = sent_message_id(
            &instance.call.campaign.id,
            &instance.call.id,
            &destination.kind,
            &to,
        );
        let is_missed = match store.get_sent_message(&id) {
            Ok(record) => record.status == Status::Failed,
            Err(StoreError::NotFound) => true,
            Err(err) => return Err(err.into()),
        };
        if is_missed {
            missed.push((instance, destination.kind, to));
        }
    }
    store.close()?;

    if missed.is_empty() {
        println!("No missed calls in the last {days} day(s).");
        return Ok(());
    }
    println!(
        "{:<22} {:<7} {:<28} {}",
        "SCHEDULED AT", "TYPE", "DESTINATION", "CALL"
    );
    for (instance, kind, to) in missed {
        println!(
            "{:<22} {:<7} {:<28} {}",
            fmt_time(instance.scheduled_at),
            kind,
            to,
            instance.call.id,
        );
    }
    Ok(())
}

fn cmd_scheduled_skip(store: &dyn Storer, id: &str) -> anyhow::Result<()> {
    let call = match store.get_scheduled_call(id) {
        Ok(call) => call,
        Err(StoreError::NotFound) => store
            .get_scheduled_call_by_short_id(id)
            .with_context(|| format!("could not find a call with id '{id}'"))?,
        Err(err) => return Err(err.into()),
    };

    for destination in &call.call.destinations {
        for to in &destination.to {
            let sent = store.has_been_sent(
                &call.call.campaign.id,
                &call.call.id,
                &destination.kind,
                to,
            )?;
            if sent {
                bail!("call '{id}' has already been sent to '{to}'");
            }
            let message = SentMessage {
                id: String::new(),
                short_id: String::new(),
                source_id: call.call.id.clone(),
                scheduled_at: call.scheduled_at,
                timestamp: String::new(),
                destination: to.clone(),
                kind: destination.kind.clone(),
                status: Status::Skipped,
                campaign_name: call.call.campaign.name.clone(),
            };
            store.add_sent_message(&call.call.campaign.id, &call.call.id, &message)?;
        }
    }
    println!("call will be skipped");
    Ok(())
}

fn cmd_sent_list(store: &dyn Storer) -> anyhow::Result<()> {
    let messages = store.list_sent_messages()?;
    if messages.is_empty() {
        println!("No sent messages.");
        return Ok(());
    }
    println!(
        "{:<10} {:<22} {:<8} {:<7} {:<28} {}",
        "SHORT ID", "SCHEDULED AT", "STATUS", "TYPE", "DESTINATION", "CAMPAIGN"
    );
    for message in messages {
        println!(
            "{:<10} {:<22} {:<8} {:<7} {:<28} {}",
            message.short_id,
            fmt_time(message.scheduled_at),
            message.status,
            message.kind,
            message.destination,
            message.campaign_name,
        );
    }
    Ok(())
}

async fn cmd_sent_delete(config: &AppConfig, store: &dyn Storer, id: &str) -> anyhow::Result<()> {
    let mut message = match store.get_sent_message(id) {
        Ok(message) => message,
        Err(StoreError::NotFound) => store
            .get_sent_message_by_short_id(id)
            .with_context(|| format!("could not find a sent message with id '{id}'"))?,
        Err(err) => return Err(err.into()),
    };

    if message.kind != "slack" {
        bail!("only slack messages can be deleted");
    }
    if message.timestamp.is_empty() {
        bail!("message '{id}' has no transport handle to delete");
    }

    slack_client(config)
        .delete_message(&message.destination, &message.timestamp)
        .await?;
    message.status = Status::Deleted;
    store.update_sent_message(&message)?;
    println!("message deleted");
    Ok(())
}

fn cmd_migrate_db(store: &dyn Storer) -> anyhow::Result<()> {
    let mut registry = MigrationRegistry::new();
    registry.apply(store)?;
    Ok(())
}

fn cmd_render(file: &Path, call_id: &str, kind: &str) -> anyhow::Result<()> {
    let data = std::fs::read(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let url = format!("file://{}", file.display());
    let source = YamlParser::new()
        .parse(&url, &data)?
        .context("document is not valid")?;
    let call = source
        .calls
        .iter()
        .find(|call| call.id == call_id)
        .with_context(|| format!("no call with id '{call_id}' in {}", file.display()))?;

    let mut data = call.data.clone();
    data.insert(
        "ScheduledAt".to_string(),
        serde_json::Value::String(fmt_time(Utc::now())),
    );
    let subject = ProcessorStack::for_subject().process(&call.subject, &data)?;
    let content = ProcessorStack::for_content(kind).process(&call.content, &data)?;

    println!("Subject: {subject}");
    println!("---");
    println!("{content}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load config")?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log.level.clone());
    init_logging(&level);

    match cli.command {
        Command::Watch => cmd_watch(config).await,
        Command::Run => cmd_run(config).await,
        Command::Scheduled(command) => match command {
            ScheduledCommand::List => {
                let store = open_store(&config, true)?;
                cmd_scheduled_list(store.as_ref())
            }
            ScheduledCommand::Refresh => cmd_scheduled_refresh(&config).await,
            ScheduledCommand::Missed { days } => cmd_scheduled_missed(&config, days).await,
            ScheduledCommand::Skip { id } => {
                let store = open_store(&config, false)?;
                cmd_scheduled_skip(store.as_ref(), &id)
            }
        },
        Command::Sent(command) => match command {
            SentCommand::List => {
                let store = open_store(&config, true)?;
                cmd_sent_list(store.as_ref())
            }
            SentCommand::Delete { id } => {
                let store = open_store(&config, false)?;
                cmd_sent_delete(&config, store.as_ref(), &id).await
            }
        },
        Command::Migrate(command) => match command {
            MigrateCommand::Db => {
                let store = open_store(&config, false)?;
                cmd_migrate_db(store.as_ref())
            }
            MigrateCommand::Source { file } => {
                let data = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let migrated = migrate_source_document(&data)?;
                print!("{migrated}");
                Ok(())
            }
        },
        Command::Render { file, call, kind } => cmd_render(&file, &call, &kind),
    }
}
