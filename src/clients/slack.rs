//! Slack Web API client.
//!
//! Destinations may be a channel name (`#general`), a user email (resolved
//! to a direct message), a handle (`@name`), or a raw conversation id.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::model::Campaign;

const DEFAULT_API_URL: &str = "https://slack.com";

#[derive(Debug, thiserror::Error)]
pub enum SlackError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("slack api error: {0}")]
    Api(String),
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("user '{0}' not found")]
    UserNotFound(String),
}

/// The Slack operations the dispatcher needs.
#[async_trait]
pub trait SlackClient: Send + Sync {
    /// Post a message; returns `(channel_id, message_ts)`.
    async fn post_message(
        &self,
        destination: &str,
        author: Option<&str>,
        subject: &str,
        content: &str,
        campaign: &Campaign,
    ) -> Result<(String, String), SlackError>;

    /// DM the author a permalink to the message that was just sent for them.
    async fn notify_author(
        &self,
        author_email: &str,
        channel_id: &str,
        message_ts: &str,
        channel_name: &str,
    ) -> Result<(), SlackError>;

    async fn delete_message(&self, destination: &str, message_ts: &str)
        -> Result<(), SlackError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserProfile {
    #[serde(default)]
    image_original: Option<String>,
    #[serde(default)]
    image_512: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: Option<UserProfile>,
}

#[derive(Debug, Deserialize)]
struct LookupUserResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    user: Option<User>,
}

#[derive(Debug, Deserialize)]
struct Conversation {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct ConversationsListResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    channels: Vec<Conversation>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct UsersListResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    members: Vec<User>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct OpenConversationResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    channel: Option<Conversation>,
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    permalink: Option<String>,
}

pub struct ApiClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl ApiClient {
    pub fn new(token: impl Into<String>, api_url: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default http client");
        Self {
            client,
            token: token.into(),
            base_url: api_url.unwrap_or(DEFAULT_API_URL).trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, SlackError> {
        let response = self
            .client
            .post(format!("{}/api/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SlackError> {
        let response = self
            .client
            .get(format!("{}/api/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    async fn lookup_user_by_email(&self, email: &str) -> Result<User, SlackError> {
        let response: LookupUserResponse = self
            .get("users.lookupByEmail", &[("email", email)])
            .await?;
        if !response.envelope.ok {
            return Err(SlackError::Api(
                response.envelope.error.unwrap_or_default(),
            ));
        }
        response
            .user
            .ok_or_else(|| SlackError::UserNotFound(email.to_string()))
    }

    async fn find_channel_by_name(&self, name: &str) -> Result<String, SlackError> {
        let mut cursor = String::new();
        loop {
            let response: ConversationsListResponse = self
                .get(
                    "conversations.list",
                    &[
                        ("types", "public_channel,private_channel"),
                        ("limit", "1000"),
                        ("cursor", &cursor),
                    ],
                )
                .await?;
            if !response.envelope.ok {
                return Err(SlackError::Api(
                    response.envelope.error.unwrap_or_default(),
                ));
            }
            if let Some(channel) = response
                .channels
                .iter()
                .find(|channel| channel.name == name)
            {
                return Ok(channel.id.clone());
            }
            cursor = response
                .response_metadata
                .map(|metadata| metadata.next_cursor)
                .unwrap_or_default();
            if cursor.is_empty() {
                return Err(SlackError::ChannelNotFound(format!("#{name}")));
            }
        }
    }

    async fn find_user_by_handle(&self, handle: &str) -> Result<String, SlackError> {
        let mut cursor = String::new();
        loop {
            let response: UsersListResponse = self
                .get("users.list", &[("limit", "1000"), ("cursor", &cursor)])
                .await?;
            if !response.envelope.ok {
                return Err(SlackError::Api(
                    response.envelope.error.unwrap_or_default(),
                ));
            }
            if let Some(user) = response.members.iter().find(|user| user.name == handle) {
                return Ok(user.id.clone());
            }
            cursor = response
                .response_metadata
                .map(|metadata| metadata.next_cursor)
                .unwrap_or_default();
            if cursor.is_empty() {
                return Err(SlackError::UserNotFound(format!("@{handle}")));
            }
        }
    }

    async fn open_direct_message(&self, user_id: &str) -> Result<String, SlackError> {
        let response: OpenConversationResponse = self
            .post(
                "conversations.open",
                &serde_json::json!({ "users": user_id }),
            )
            .await?;
        if !response.envelope.ok {
            return Err(SlackError::Api(
                response.envelope.error.unwrap_or_default(),
            ));
        }
        response
            .channel
            .map(|channel| channel.id)
            .ok_or_else(|| SlackError::Api("missing channel in response".to_string()))
    }

    /// Resolve a destination to a conversation id. Unrecognised shapes are
    /// assumed to already be conversation ids.
    pub async fn get_channel_id(&self, destination: &str) -> Result<String, SlackError> {
        if let Some(name) = destination.strip_prefix('#') {
            return self.find_channel_by_name(name).await;
        }
        if destination.contains('@') && !destination.starts_with('@') {
            let user = self.lookup_user_by_email(destination).await?;
            return self.open_direct_message(&user.id).await;
        }
        if let Some(handle) = destination.strip_prefix('@') {
            let user_id = self.find_user_by_handle(handle).await?;
            return self.open_direct_message(&user_id).await;
        }
        Ok(destination.to_string())
    }
}

#[async_trait]
impl SlackClient for ApiClient {
    async fn post_message(
        &self,
        destination: &str,
        author: Option<&str>,
        subject: &str,
        content: &str,
        campaign: &Campaign,
    ) -> Result<(String, String), SlackError> {
        let mut message = if subject.is_empty() {
            content.to_string()
        } else {
            format!("*{subject}*\n{content}")
        };

        let mut username = None;
        let mut icon_url = None;
        if let Some(author) = author {
            match self.lookup_user_by_email(author).await {
                Ok(user) => {
                    let display_name = user
                        .real_name
                        .filter(|name| !name.is_empty())
                        .unwrap_or(user.name);
                    username = Some(display_name);
                    icon_url = user.profile.and_then(|profile| {
                        profile.image_original.or(profile.image_512)
                    });
                }
                // Author has no Slack account: attribute in the body instead.
                Err(_) => message = format!("{message}\n\n---\nThx: {author}"),
            }
        } else if !campaign.name.is_empty() {
            username = Some(campaign.name.clone());
            icon_url = campaign.icon_url.clone();
        }

        let channel_id = self.get_channel_id(destination).await?;
        let mut body = serde_json::json!({
            "channel": channel_id,
            "text": message,
        });
        if let Some(username) = username {
            body["username"] = serde_json::Value::String(username);
        }
        if let Some(icon_url) = icon_url {
            body["icon_url"] = serde_json::Value::String(icon_url);
        }

        let response: PostMessageResponse = self.post("chat.postMessage", &body).await?;
        if !response.envelope.ok {
            return Err(SlackError::Api(
                response.envelope.error.unwrap_or_default(),
            ));
        }
        Ok((
            response.channel.unwrap_or(channel_id),
            response.ts.unwrap_or_default(),
        ))
    }

    async fn notify_author(
        &self,
        author_email: &str,
        channel_id: &str,
        message_ts: &str,
        channel_name: &str,
    ) -> Result<(), SlackError> {
        let user = self.lookup_user_by_email(author_email).await?;
        let dm = self.open_direct_message(&user.id).await?;

        let response: PermalinkResponse = self
            .get(
                "chat.getPermalink",
                &[("channel", channel_id), ("message_ts", message_ts)],
            )
            .await?;
        if !response.envelope.ok {
            return Err(SlackError::Api(
                response.envelope.error.unwrap_or_default(),
            ));
        }
        let permalink = response.permalink.unwrap_or_default();

        let body = serde_json::json!({
            "channel": dm,
            "text": format!(
                "I have just sent your message to {channel_name}. You can view it here: {permalink}"
            ),
        });
        let response: PostMessageResponse = self.post("chat.postMessage", &body).await?;
        if !response.envelope.ok {
            return Err(SlackError::Api(
                response.envelope.error.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn delete_message(
        &self,
        destination: &str,
        message_ts: &str,
    ) -> Result<(), SlackError> {
        let channel_id = self.get_channel_id(destination).await?;
        let body = serde_json::json!({ "channel": channel_id, "ts": message_ts });
        let response: PostMessageResponse = self.post("chat.delete", &body).await?;
        if !response.envelope.ok {
            return Err(SlackError::Api(
                response.envelope.error.unwrap_or_default(),
            ));
        }
        Ok(())
    }
}
