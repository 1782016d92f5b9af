//! The long-lived run loop: periodic source refresh, periodic dispatch
//! ticks, and SIGHUP-forced refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clients::email::EmailClient;
use crate::clients::slack::SlackClient;
use crate::config::AppConfig;
use crate::kv::{SentMessage, Status, StoreError, Storer};
use crate::model::Source;
use crate::poller::Poller;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::sourcer::SourceError;

mod dispatch;

#[cfg(test)]
mod tests;

pub use dispatch::process_call;

const MESSAGE_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to refresh sources: {0}")]
    Source(#[from] SourceError),
    #[error("failed to refresh schedule: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to hash sources: {0}")]
    Hash(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Worker {
    store: Arc<dyn Storer>,
    slack: Arc<dyn SlackClient>,
    email: Arc<dyn EmailClient>,
    poller: Poller,
    scheduler: Scheduler,
    source_urls: Vec<String>,
    refresh_interval: Duration,
    calculation_before: Duration,
    calculation_after: Duration,
    missed_lookback: Duration,
    dry_run: bool,
    last_sources_hash: String,
}

fn hash_sources(sources: &[Source]) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(sources)?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

impl Worker {
    pub fn new(
        store: Arc<dyn Storer>,
        slack: Arc<dyn SlackClient>,
        email: Arc<dyn EmailClient>,
        poller: Poller,
        scheduler: Scheduler,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            slack,
            email,
            poller,
            scheduler,
            source_urls: config.source.urls.clone(),
            refresh_interval: config.watch.refresh_interval,
            calculation_before: config.worker.calculation.before,
            calculation_after: config.worker.calculation.after,
            missed_lookback: config.worker.missed_lookback,
            dry_run: config.dispatcher.dry_run,
            last_sources_hash: String::new(),
        }
    }

    /// One poll-and-dispatch pass, used by the `run` subcommand.
    pub async fn run_once(&mut self) -> Result<(), WorkerError> {
        self.refresh_sources().await?;
        self.process_messages().await?;
        Ok(())
    }

    /// The worker loop. Runs until SIGINT/SIGTERM; an in-flight handler
    /// always completes before shutdown.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        info!("starting worker");

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let mut refresh_ticker = tokio::time::interval(self.refresh_interval);
        refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut message_ticker = tokio::time::interval(MESSAGE_TICK);
        message_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = refresh_ticker.tick() => {
                    if let Err(err) = self.refresh_sources().await {
                        error!("error running source refresh: {}", err);
                    }
                }
                _ = message_ticker.tick() => {
                    if let Err(err) = self.process_messages().await {
                        error!("error running message processing: {}", err);
                    }
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, running poller");
                    refresh_ticker.reset();
                    if let Err(err) = self.refresh_sources().await {
                        error!("error running source refresh: {}", err);
                    }
                }
                _ = sigint.recv() => {
                    info!("shutdown requested");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Poll the configured sources; when changed sources come back and
    /// their content hash moved, rebuild the persisted schedule.
    pub async fn refresh_sources(&mut self) -> Result<(), WorkerError> {
        debug!("polling for calls: {:?}", self.source_urls);
        let sources = self.poller.poll(&self.source_urls).await?;
        if sources.is_empty() {
            return Ok(());
        }

        let new_hash = hash_sources(&sources)?;
        if new_hash != self.last_sources_hash {
            info!("sources have changed, refreshing schedule");
            self.scheduler.refresh(
                &sources,
                Utc::now(),
                self.calculation_before,
                self.calculation_after,
            )?;
            self.last_sources_hash = new_hash;
        }
        Ok(())
    }

    /// One dispatch tick over the persisted schedule.
    pub async fn process_messages(&self) -> Result<(), WorkerError> {
        let calls = self.store.list_scheduled_calls()?;
        let lookback = chrono::Duration::seconds(self.missed_lookback.as_secs() as i64);

        for scheduled in calls {
            let now = Utc::now();
            if now < scheduled.scheduled_at {
                debug!(
                    "skipping call scheduled for the future: {} at {}",
                    scheduled.id, scheduled.scheduled_at
                );
                continue;
            }

            if scheduled.scheduled_at < now - lookback {
                warn!(
                    "skipping call outside lookback period: {} scheduled at {}",
                    scheduled.id, scheduled.scheduled_at
                );
                self.record_missed(&scheduled);
                if let Err(err) = self.store.delete_scheduled_call(&scheduled.id) {
                    error!("failed to delete scheduled call {}: {}", scheduled.id, err);
                }
                continue;
            }

            if let Err(err) = process_call(
                &scheduled,
                self.store.as_ref(),
                self.slack.as_ref(),
                self.email.as_ref(),
                self.dry_run,
            )
            .await
            {
                error!("error processing call {}: {}", scheduled.id, err);
            }
            if let Err(err) = self.store.delete_scheduled_call(&scheduled.id) {
                error!("failed to delete scheduled call {}: {}", scheduled.id, err);
            }
        }
        Ok(())
    }

    fn record_missed(&self, scheduled: &crate::kv::ScheduledCall) {
        let destination = match scheduled.call.destinations.first() {
            Some(destination) => destination,
            None => return,
        };
        let to = match destination.to.first() {
            Some(to) => to,
            None => return,
        };
        let message = SentMessage {
            id: String::new(),
            short_id: String::new(),
            source_id: scheduled.call.id.clone(),
            scheduled_at: scheduled.scheduled_at,
            timestamp: String::new(),
            destination: to.clone(),
            kind: destination.kind.clone(),
            status: Status::Failed,
            campaign_name: scheduled.call.campaign.name.clone(),
        };
        if let Err(err) =
            self.store
                .add_sent_message(&scheduled.call.campaign.id, &scheduled.call.id, &message)
        {
            error!(
                "failed to add sent message for missed call {}: {}",
                scheduled.call.id, err
            );
        }
    }
}
