use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscordError>;

#[derive(Debug, Error)]
pub enum DiscordError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Attachment error ({path}): {message}")]
    Attachment { path: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl DiscordError {
    /// True when the API refused the request because the credential is bad.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, DiscordError::Api { status: 401, .. })
    }
}

impl From<reqwest::Error> for DiscordError {
    fn from(err: reqwest::Error) -> Self {
        DiscordError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for DiscordError {
    fn from(err: serde_json::Error) -> Self {
        DiscordError::Parse(err.to_string())
    }
}
