use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PagewatchError, Result};
use crate::types::PageTarget;

const DEFAULT_INTERVAL: &str = "*/5 * * * *";
const DEFAULT_PAGE_URL_TEMPLATE: &str = "https://www.facebook.com/{page}";

/// How often pages are checked while online. Only the `*/N` minute form is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInterval {
    minutes: u32,
}

impl CheckInterval {
    pub fn every_minutes(minutes: u32) -> Result<Self> {
        if !(1..=59).contains(&minutes) {
            return Err(PagewatchError::Config(format!(
                "check interval must be between 1 and 59 minutes, got {minutes}"
            )));
        }
        Ok(Self { minutes })
    }

    /// Parse `*/N` or `*/N * * * *`. Any other cron form is rejected.
    pub fn parse(pattern: &str) -> Result<Self> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        let unsupported = || {
            PagewatchError::Config(format!(
                "unsupported CHECK_INTERVAL '{pattern}': only '*/N * * * *' is supported"
            ))
        };

        let minute_field = match fields.as_slice() {
            [minute] => *minute,
            [minute, rest @ ..] if rest.len() == 4 && rest.iter().all(|f| *f == "*") => *minute,
            _ => return Err(unsupported()),
        };

        let n = minute_field
            .strip_prefix("*/")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(unsupported)?;

        Self::every_minutes(n)
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.minutes) * 60)
    }
}

/// Which browser renders pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageBackend {
    /// Local Chromium with `--dump-dom`. Always headless.
    Chrome { bin: String },
    Browserless {
        base_url: String,
        token: Option<String>,
        headless: bool,
    },
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub targets: Vec<PageTarget>,
    pub check_interval: CheckInterval,
    pub storage_path: PathBuf,
    pub media_dir: PathBuf,
    pub headless: bool,
    pub page_url_template: String,
    pub discord_token: String,
    pub ffmpeg_path: String,
    pub page_backend: PageBackend,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log_redacted();
        Ok(config)
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| PagewatchError::Config(format!("{key} environment variable is required")))
        };

        let targets = parse_targets(&required("PAGE_TARGETS")?)?;
        let check_interval =
            CheckInterval::parse(&get("CHECK_INTERVAL").unwrap_or_else(|| DEFAULT_INTERVAL.to_string()))?;

        let headless = match get("HEADLESS") {
            None => true,
            Some(v) => parse_bool(&v)
                .ok_or_else(|| PagewatchError::Config(format!("HEADLESS must be true or false, got '{v}'")))?,
        };

        let page_url_template =
            get("PAGE_URL_TEMPLATE").unwrap_or_else(|| DEFAULT_PAGE_URL_TEMPLATE.to_string());
        if !page_url_template.contains("{page}") {
            return Err(PagewatchError::Config(
                "PAGE_URL_TEMPLATE must contain a {page} placeholder".to_string(),
            ));
        }

        let page_backend = match get("BROWSERLESS_URL") {
            Some(base_url) => PageBackend::Browserless {
                base_url,
                token: get("BROWSERLESS_TOKEN"),
                headless,
            },
            None => PageBackend::Chrome {
                bin: get("CHROME_BIN").unwrap_or_else(|| "chromium".to_string()),
            },
        };

        Ok(Self {
            targets,
            check_interval,
            storage_path: PathBuf::from(get("STORAGE_PATH").unwrap_or_else(|| "data/posts.json".to_string())),
            media_dir: PathBuf::from(get("MEDIA_DIR").unwrap_or_else(|| "media".to_string())),
            headless,
            page_url_template,
            discord_token: required("DISCORD_TOKEN")?,
            ffmpeg_path: get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            page_backend,
        })
    }

    pub fn page_url(&self, page_id: &str) -> String {
        render_page_url(&self.page_url_template, page_id)
    }

    /// `HEADLESS=false` has no effect on the local backend: `--dump-dom`
    /// only works headless.
    pub fn headless_ignored(&self) -> bool {
        !self.headless && matches!(self.page_backend, PageBackend::Chrome { .. })
    }

    pub fn log_redacted(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  PAGE_TARGETS: {} page(s)", self.targets.len());
        tracing::info!("  CHECK_INTERVAL: every {} minute(s)", self.check_interval.minutes());
        tracing::info!("  STORAGE_PATH: {}", self.storage_path.display());
        tracing::info!("  MEDIA_DIR: {}", self.media_dir.display());
        tracing::info!("  DISCORD_TOKEN: {}", preview(&self.discord_token));
        match &self.page_backend {
            PageBackend::Chrome { bin } => {
                tracing::info!("  Page backend: chrome ({bin})");
                if self.headless_ignored() {
                    tracing::warn!("HEADLESS=false is ignored by the chrome backend (--dump-dom needs headless)");
                }
            }
            PageBackend::Browserless { base_url, headless, .. } => {
                tracing::info!("  Page backend: browserless ({base_url}, headless={headless})")
            }
        }
    }
}

/// First few characters of a secret, for logs.
fn preview(val: &str) -> String {
    let head: String = val.chars().take(5).collect();
    format!("{head}...({} chars)", val.chars().count())
}

/// Substitute a page identifier into a `{page}` URL template.
pub fn render_page_url(template: &str, page_id: &str) -> String {
    template.replace("{page}", page_id)
}

/// Parse `page:channel,page:channel`.
fn parse_targets(raw: &str) -> Result<Vec<PageTarget>> {
    let mut targets = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (page_id, channel_id) = entry.split_once(':').ok_or_else(|| {
            PagewatchError::Config(format!("PAGE_TARGETS entry '{entry}' must be page:channel"))
        })?;
        let (page_id, channel_id) = (page_id.trim(), channel_id.trim());
        if page_id.is_empty() || channel_id.is_empty() {
            return Err(PagewatchError::Config(format!(
                "PAGE_TARGETS entry '{entry}' has an empty page or channel"
            )));
        }
        if targets.iter().any(|t: &PageTarget| t.page_id == page_id) {
            return Err(PagewatchError::Config(format!(
                "page '{page_id}' is listed more than once in PAGE_TARGETS"
            )));
        }
        targets.push(PageTarget {
            page_id: page_id.to_string(),
            channel_id: channel_id.to_string(),
        });
    }

    if targets.is_empty() {
        return Err(PagewatchError::Config("PAGE_TARGETS lists no pages".to_string()));
    }
    Ok(targets)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
