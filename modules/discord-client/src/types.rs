use serde::{Deserialize, Serialize};

/// A file on local disk to upload with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub content: String,
    pub attachments: Vec<Attachment>,
}

/// JSON part of a multipart message upload.
#[derive(Debug, Serialize)]
pub(crate) struct MessagePayload<'a> {
    pub content: &'a str,
    pub attachments: Vec<AttachmentRef<'a>>,
    pub allowed_mentions: AllowedMentions,
}

#[derive(Debug, Serialize)]
pub(crate) struct AttachmentRef<'a> {
    pub id: usize,
    pub filename: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct AllowedMentions {
    pub parse: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub attachments: Vec<MessageAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageAttachment {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
}
