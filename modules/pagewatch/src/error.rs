use thiserror::Error;

pub type Result<T> = std::result::Result<T, PagewatchError>;

/// Failure classes of a page check. Everything except `Config` and `Auth`
/// is recoverable and handled at the page-check boundary.
#[derive(Error, Debug)]
pub enum PagewatchError {
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("No connectivity: all probe endpoints unreachable")]
    Connectivity,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notifier authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<discord_client::DiscordError> for PagewatchError {
    fn from(err: discord_client::DiscordError) -> Self {
        PagewatchError::Delivery(err.to_string())
    }
}
