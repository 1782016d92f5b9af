//! Rendering and delivery of one scheduled call.

use std::time::Duration;

use chrono::SecondsFormat;
use tracing::{debug, error, info, warn};

use super::WorkerError;
use crate::clients::email::EmailClient;
use crate::clients::slack::SlackClient;
use crate::kv::{ScheduledCall, SentMessage, Status, Storer};
use crate::processor::ProcessorStack;

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Render a scheduled call for its destination, deliver it, and record the
/// outcome. A prior terminal record for the `(campaign, call, destination)`
/// key skips delivery; a prior failure does not.
pub async fn process_call(
    scheduled: &ScheduledCall,
    store: &dyn Storer,
    slack: &dyn SlackClient,
    email: &dyn EmailClient,
    dry_run: bool,
) -> Result<(), WorkerError> {
    debug!("processing call {}", scheduled.id);
    let call = &scheduled.call;
    let destination = match call.destinations.first() {
        Some(destination) => destination,
        None => {
            warn!("skipping call with no destinations: {}", call.id);
            return Ok(());
        }
    };
    if destination.to.is_empty() {
        warn!("skipping call with no address in `to`: {}", call.id);
        return Ok(());
    }

    for to in &destination.to {
        let sent = store.has_been_sent(&call.campaign.id, &call.id, &destination.kind, to)?;
        if sent {
            debug!(
                "skipping call that has already been sent: {} to {} ({})",
                call.id, to, destination.kind
            );
            continue;
        }

        let record = |status: Status, timestamp: String| SentMessage {
            id: String::new(),
            short_id: String::new(),
            source_id: call.id.clone(),
            scheduled_at: scheduled.scheduled_at,
            timestamp,
            destination: to.clone(),
            kind: destination.kind.clone(),
            status,
            campaign_name: call.campaign.name.clone(),
        };

        let mut data = call.data.clone();
        data.insert(
            "ScheduledAt".to_string(),
            serde_json::Value::String(
                scheduled
                    .scheduled_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        );

        let subject_stack = ProcessorStack::for_subject();
        let content_stack = ProcessorStack::for_content(&destination.kind);

        let subject = match subject_stack.process(&call.subject, &data) {
            Ok(subject) => subject,
            Err(err) => {
                error!("failed to process subject for {}: {}", call.id, err);
                store.add_sent_message(
                    &call.campaign.id,
                    &call.id,
                    &record(Status::Failed, String::new()),
                )?;
                continue;
            }
        };
        let content = match content_stack.process(&call.content, &data) {
            Ok(content) => content,
            Err(err) => {
                error!("failed to process content for {}: {}", call.id, err);
                store.add_sent_message(
                    &call.campaign.id,
                    &call.id,
                    &record(Status::Failed, String::new()),
                )?;
                continue;
            }
        };

        if dry_run {
            info!(
                "dry run: would send message call_id={} campaign={} subject={:?} destination={} type={} scheduled_at={}",
                call.id, call.campaign.name, subject, to, destination.kind, scheduled.scheduled_at
            );
            continue;
        }

        match destination.kind.as_str() {
            "slack" => {
                info!("sending slack message: {} to {}", call.id, to);
                let post = tokio::time::timeout(
                    TRANSPORT_TIMEOUT,
                    slack.post_message(to, call.author.as_deref(), &subject, &content, &call.campaign),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(crate::clients::slack::SlackError::Api(
                        "transport timed out".to_string(),
                    ))
                });

                match post {
                    Ok((channel_id, timestamp)) => {
                        info!("sent slack message: {} to {}", call.id, to);
                        store.add_sent_message(
                            &call.campaign.id,
                            &call.id,
                            &record(Status::Sent, timestamp.clone()),
                        )?;
                        if let Some(author) = call.author.as_deref() {
                            if let Err(err) = slack
                                .notify_author(author, &channel_id, &timestamp, to)
                                .await
                            {
                                error!("failed to send author notification: {}", err);
                            }
                        }
                    }
                    Err(err) => {
                        error!("failed to send slack message: {}", err);
                        store.add_sent_message(
                            &call.campaign.id,
                            &call.id,
                            &record(Status::Failed, String::new()),
                        )?;
                    }
                }
            }
            "email" => {
                info!("sending email: {} to {}", call.id, to);
                let send = tokio::time::timeout(
                    TRANSPORT_TIMEOUT,
                    email.send(
                        std::slice::from_ref(to),
                        call.author.as_deref(),
                        &subject,
                        &content,
                        &call.campaign,
                    ),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(crate::clients::email::EmailError::Partial(
                        "transport timed out".to_string(),
                    ))
                });

                match send {
                    Ok(()) => {
                        info!("sent email: {} to {}", call.id, to);
                        store.add_sent_message(
                            &call.campaign.id,
                            &call.id,
                            &record(Status::Sent, String::new()),
                        )?;
                    }
                    Err(err) => {
                        error!("failed to send email: {}", err);
                        store.add_sent_message(
                            &call.campaign.id,
                            &call.id,
                            &record(Status::Failed, String::new()),
                        )?;
                    }
                }
            }
            other => {
                warn!("unsupported destination type '{}' on call {}", other, call.id);
                store.add_sent_message(
                    &call.campaign.id,
                    &call.id,
                    &record(Status::Failed, String::new()),
                )?;
            }
        }
    }

    Ok(())
}
