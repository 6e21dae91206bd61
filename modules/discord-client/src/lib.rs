pub mod error;
pub mod types;

pub use error::{DiscordError, Result};
pub use types::{Attachment, Message, MessageAttachment, OutgoingMessage, User};

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use types::{AllowedMentions, AttachmentRef, MessagePayload};

const BASE_URL: &str = "https://discord.com/api/v10";

pub struct DiscordClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl DiscordClient {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(token, BASE_URL)
    }

    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(DiscordError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Resolve the bot user behind the token. Fails with a 401 API error on a bad credential.
    pub async fn current_user(&self) -> Result<User> {
        let resp = self
            .client
            .get(format!("{}/users/@me", self.base_url))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        Self::parse(resp).await
    }

    /// Post a message to a channel, uploading any attachments as multipart files.
    pub async fn create_message(&self, channel_id: &str, message: &OutgoingMessage) -> Result<Message> {
        let payload = MessagePayload {
            content: &message.content,
            attachments: message
                .attachments
                .iter()
                .enumerate()
                .map(|(id, a)| AttachmentRef {
                    id,
                    filename: &a.name,
                })
                .collect(),
            allowed_mentions: AllowedMentions { parse: Vec::new() },
        };

        let mut form = Form::new().text("payload_json", serde_json::to_string(&payload)?);

        for (i, attachment) in message.attachments.iter().enumerate() {
            let bytes = tokio::fs::read(&attachment.path)
                .await
                .map_err(|e| DiscordError::Attachment {
                    path: attachment.path.clone(),
                    message: e.to_string(),
                })?;
            let part = Part::bytes(bytes).file_name(attachment.name.clone());
            form = form.part(format!("files[{i}]"), part);
        }

        tracing::debug!(
            channel_id,
            attachments = message.attachments.len(),
            "Sending Discord message"
        );

        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.base_url, channel_id))
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await?;

        Self::parse(resp).await
    }
}
