//! SMTP delivery via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::model::Campaign;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("failed to send email to some recipients: {0}")]
    Partial(String),
}

#[async_trait]
pub trait EmailClient: Send + Sync {
    async fn send(
        &self,
        to: &[String],
        author: Option<&str>,
        subject: &str,
        body: &str,
        campaign: &Campaign,
    ) -> Result<(), EmailError>;
}

/// SMTP client with author impersonation: the first attempt uses the author
/// as the `From` address; if the relay rejects that (SPF/DKIM), the message
/// is retried from the configured sender with `Reply-To` set to the author.
pub struct SmtpClient {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Option<Address>,
}

impl SmtpClient {
    pub fn new(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        from: &str,
    ) -> Result<Self, EmailError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
            .port(port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();
        // An unset sender only matters once a message actually goes out.
        let from = if from.is_empty() {
            None
        } else {
            Some(from.parse()?)
        };
        Ok(Self { transport, from })
    }

    fn build_message(
        &self,
        from: Mailbox,
        reply_to: Option<&Mailbox>,
        to: &Address,
        subject: &str,
        body: &str,
    ) -> Result<Message, EmailError> {
        let mut builder = Message::builder()
            .from(from)
            .to(Mailbox::new(None, to.clone()))
            .subject(subject)
            .header(ContentType::TEXT_HTML);
        if let Some(reply_to) = reply_to {
            builder = builder.reply_to(reply_to.clone());
        }
        Ok(builder.body(body.to_string())?)
    }

    fn default_sender(&self, campaign: &Campaign) -> Result<Mailbox, EmailError> {
        let from = self
            .from
            .clone()
            .ok_or_else(|| EmailError::Partial("email.from is not configured".to_string()))?;
        let display_name = (!campaign.name.is_empty()).then(|| campaign.name.clone());
        Ok(Mailbox::new(display_name, from))
    }
}

#[async_trait]
impl EmailClient for SmtpClient {
    async fn send(
        &self,
        to: &[String],
        author: Option<&str>,
        subject: &str,
        body: &str,
        campaign: &Campaign,
    ) -> Result<(), EmailError> {
        let author_mailbox: Option<Mailbox> = match author {
            Some(author) => Some(author.parse()?),
            None => None,
        };

        let mut failures = Vec::new();
        for recipient in to {
            let address: Address = match recipient.parse() {
                Ok(address) => address,
                Err(err) => {
                    failures.push(format!("{recipient}: {err}"));
                    continue;
                }
            };

            if let Some(author) = &author_mailbox {
                let message = self.build_message(
                    author.clone(),
                    Some(author),
                    &address,
                    subject,
                    body,
                )?;
                match self.transport.send(message).await {
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(
                            "sending as author {} rejected ({}); retrying as configured sender",
                            author, err
                        );
                    }
                }
            }

            let message = self.build_message(
                self.default_sender(campaign)?,
                author_mailbox.as_ref(),
                &address,
                subject,
                body,
            )?;
            if let Err(err) = self.transport.send(message).await {
                failures.push(format!("{recipient}: {err}"));
            }
        }

        if !failures.is_empty() {
            return Err(EmailError::Partial(failures.join("; ")));
        }
        Ok(())
    }
}
