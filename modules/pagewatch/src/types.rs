use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A watched page and the channel its posts are relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTarget {
    pub page_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub kind: MediaKind,
    /// None when the download failed; such items are dropped before delivery.
    pub local_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedLink {
    pub url: String,
}

/// Canonical content record for one post, built fresh on every check.
#[derive(Debug, Clone)]
pub struct ExtractedPost {
    pub canonical_url: Option<String>,
    pub text: String,
    pub embedded_link: Option<EmbeddedLink>,
    pub media: Vec<MediaItem>,
    pub observed_at: DateTime<Utc>,
}

/// A remote media reference found in the markup, before download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub source_url: String,
}

/// What the markup says about the newest post, before any media is fetched.
///
/// Link posts and media posts are mutually exclusive: when `embedded_link`
/// is set, `media` is always empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOutline {
    pub canonical_url: Option<String>,
    pub text: String,
    pub embedded_link: Option<EmbeddedLink>,
    pub media: Vec<MediaRef>,
}

/// Last post seen on a page. The persisted projection of `ExtractedPost`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenPostRecord {
    pub url: Option<String>,
    pub timestamp: String,
}
