// Delivery: turn an extracted post into a chat message, send it, then
// remove the media files it consumed.

use std::path::Path;

use async_trait::async_trait;
use discord_client::{Attachment, DiscordClient, OutgoingMessage};
use tracing::{info, warn};

use crate::error::{PagewatchError, Result};
use crate::types::{ExtractedPost, PageTarget};

/// Files at or above this size are never attached.
pub const MAX_ATTACHMENT_BYTES: u64 = 25_000_000;

/// Chat platform limit on message text.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Message handed to a notifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
    pub attachments: Vec<AttachmentFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFile {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message to a channel. Rejections are `PagewatchError::Delivery`.
    async fn send(&self, channel_id: &str, notification: &Notification) -> Result<SentMessage>;
}

pub struct DiscordNotifier {
    client: DiscordClient,
}

impl DiscordNotifier {
    pub fn new(token: &str) -> Result<Self> {
        Ok(Self {
            client: DiscordClient::new(token)?,
        })
    }

    /// Verify the credential. Any failure here is fatal at startup.
    pub async fn authenticate(&self) -> Result<()> {
        let user = self
            .client
            .current_user()
            .await
            .map_err(auth_error)?;
        info!(user = %user.username, id = %user.id, bot = user.bot, "Authenticated with Discord");
        Ok(())
    }
}

fn auth_error(err: discord_client::DiscordError) -> PagewatchError {
    if err.is_unauthorized() {
        PagewatchError::Auth("Discord rejected the bot token".to_string())
    } else {
        PagewatchError::Auth(format!("could not verify the bot token: {err}"))
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, channel_id: &str, notification: &Notification) -> Result<SentMessage> {
        let message = OutgoingMessage {
            content: notification.text.clone(),
            attachments: notification
                .attachments
                .iter()
                .map(|a| Attachment {
                    path: a.path.clone(),
                    name: a.name.clone(),
                })
                .collect(),
        };
        let sent = self.client.create_message(channel_id, &message).await?;
        Ok(SentMessage { id: sent.id })
    }
}

/// Outcome of a successful delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attached: usize,
    pub skipped_oversize: usize,
    pub cleanup_failures: usize,
}

/// Message text: page identifier, post text, and the link for link posts.
pub fn message_text(page_id: &str, post: &ExtractedPost) -> String {
    let mut parts = vec![format!("**{page_id}**")];
    if !post.text.is_empty() {
        parts.push(post.text.clone());
    }
    if let Some(link) = &post.embedded_link {
        parts.push(link.url.clone());
    }
    truncate_chars(&parts.join("\n"), MAX_MESSAGE_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}

/// Send a post to its channel.
///
/// Link posts go out as text only. Otherwise every downloaded media file
/// under the size cap is attached. Media files are removed only after the
/// notifier accepted the message; on rejection they stay on disk.
pub async fn deliver(
    notifier: &dyn Notifier,
    target: &PageTarget,
    post: &ExtractedPost,
) -> Result<DeliveryReport> {
    let page = target.page_id.as_str();
    let mut notification = Notification {
        text: message_text(page, post),
        attachments: Vec::new(),
    };
    let mut report = DeliveryReport::default();
    let mut oversize = Vec::new();

    if post.embedded_link.is_none() {
        for path in post.media.iter().filter_map(|m| m.local_path.as_deref()) {
            let size = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!(page, path, error = %e, "Media file unreadable, not attaching");
                    continue;
                }
            };
            if size >= MAX_ATTACHMENT_BYTES {
                warn!(page, path, size, limit = MAX_ATTACHMENT_BYTES, "Media file too large, not attaching");
                oversize.push(path.to_string());
                continue;
            }
            notification.attachments.push(AttachmentFile {
                path: path.to_string(),
                name: file_name(path),
            });
        }
    }
    report.attached = notification.attachments.len();
    report.skipped_oversize = oversize.len();

    if let Err(e) = notifier.send(&target.channel_id, &notification).await {
        let left: Vec<&str> = notification
            .attachments
            .iter()
            .map(|a| a.path.as_str())
            .chain(oversize.iter().map(String::as_str))
            .collect();
        if !left.is_empty() {
            warn!(page, files = ?left, "Delivery failed, media files left on disk");
        }
        return Err(match e {
            PagewatchError::Delivery(_) => e,
            other => PagewatchError::Delivery(other.to_string()),
        });
    }

    info!(
        page,
        channel = %target.channel_id,
        attachments = report.attached,
        "Post delivered"
    );

    let consumed: Vec<String> = notification
        .attachments
        .into_iter()
        .map(|a| a.path)
        .chain(oversize)
        .collect();
    report.cleanup_failures = cleanup(page, &consumed).await;
    Ok(report)
}

/// Remove each file independently. Returns the number of failures.
async fn cleanup(page: &str, paths: &[String]) -> usize {
    let results = futures::future::join_all(paths.iter().map(|path| async move {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| (path.as_str(), e))
    }))
    .await;

    let mut failures = 0;
    for result in results {
        if let Err((path, e)) = result {
            warn!(page, path, error = %e, "Failed to remove delivered media file");
            failures += 1;
        }
    }
    failures
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmbeddedLink;
    use chrono::Utc;
    use discord_client::DiscordError;

    #[test]
    fn rejected_token_is_reported_as_such() {
        let rejected = auth_error(DiscordError::Api {
            status: 401,
            message: "401: Unauthorized".to_string(),
        });
        assert!(matches!(rejected, PagewatchError::Auth(ref msg) if msg.contains("rejected the bot token")));

        let unreachable = auth_error(DiscordError::Network("connection refused".to_string()));
        assert!(matches!(unreachable, PagewatchError::Auth(ref msg) if msg.contains("connection refused")));
    }

    fn post(text: &str) -> ExtractedPost {
        ExtractedPost {
            canonical_url: Some("/posts/1".to_string()),
            text: text.to_string(),
            embedded_link: None,
            media: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn text_starts_with_page_identifier() {
        assert_eq!(message_text("alpha", &post("hello")), "**alpha**\nhello");
        assert_eq!(message_text("alpha", &post("")), "**alpha**");
    }

    #[test]
    fn link_is_appended_as_plain_text() {
        let mut p = post("read this");
        p.embedded_link = Some(EmbeddedLink {
            url: "https://example.com/a".to_string(),
        });
        assert_eq!(
            message_text("alpha", &p),
            "**alpha**\nread this\nhttps://example.com/a"
        );
    }

    #[test]
    fn long_text_is_truncated_to_platform_limit() {
        let p = post(&"é".repeat(5000));
        let text = message_text("alpha", &p);
        assert_eq!(text.chars().count(), MAX_MESSAGE_CHARS);
        assert!(text.ends_with('…'));
    }

    #[test]
    fn file_name_is_last_component() {
        assert_eq!(file_name("/media/alpha_1_0.jpg"), "alpha_1_0.jpg");
    }

    #[tokio::test]
    async fn cleanup_failures_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.jpg");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();
        let missing = dir.path().join("missing.jpg");

        let paths: Vec<String> = [&a, &missing, &b]
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let failures = cleanup("alpha", &paths).await;

        assert_eq!(failures, 1);
        assert!(!a.exists());
        assert!(!b.exists());
    }
}
