// Media download and re-encode.
//
// Downloads stream straight to disk. Videos are re-encoded in place to
// H.264/AAC mp4 so chat clients can play them inline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::PagewatchError;
use crate::types::MediaKind;

/// Images at or below this many bytes are icons, tracking pixels or emoji.
pub const MIN_IMAGE_BYTES: u64 = 2048;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const ENCODE_TIMEOUT: Duration = Duration::from_secs(600);

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Size the server reports for a resource, without downloading it.
    async fn probe_size(&self, url: &str) -> Option<u64>;

    /// Download one media item. Returns the local path, or `None` when the
    /// item has to be dropped (the cause is logged).
    async fn fetch(&self, page_id: &str, url: &str, kind: MediaKind, ordinal: usize) -> Option<String>;
}

/// Whether a probed image is worth downloading. Unknown sizes do not qualify.
pub fn image_qualifies(size: Option<u64>) -> bool {
    size.is_some_and(|bytes| bytes > MIN_IMAGE_BYTES)
}

/// `{page}_{unix_millis}_{ordinal}.{ext}`, with the page identifier reduced
/// to filename-safe characters.
pub fn media_file_name(page_id: &str, url: &str, kind: MediaKind, millis: i64, ordinal: usize) -> String {
    let page: String = page_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{page}_{millis}_{ordinal}.{}", extension_for(url, kind))
}

fn extension_for(url: &str, kind: MediaKind) -> String {
    match kind {
        MediaKind::Video => "mp4".to_string(),
        MediaKind::Image => url::Url::parse(url)
            .ok()
            .and_then(|u| {
                Path::new(u.path())
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
            })
            .filter(|e| matches!(e.as_str(), "jpg" | "jpeg" | "png" | "gif" | "webp"))
            .unwrap_or_else(|| "jpg".to_string()),
    }
}

pub struct HttpMediaFetcher {
    client: reqwest::Client,
    media_dir: PathBuf,
    ffmpeg_path: String,
}

impl HttpMediaFetcher {
    pub fn new(media_dir: impl Into<PathBuf>, ffmpeg_path: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            media_dir: media_dir.into(),
            ffmpeg_path: ffmpeg_path.to_string(),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let resp = self.client.get(url).send().await.context("request failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status}");
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("body stream failed")?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Re-encode to a normalized mp4, replacing the original file.
    async fn reencode(&self, path: &Path) -> Result<()> {
        let encoded = path.with_extension("encoding.mp4");
        let output = tokio::time::timeout(
            ENCODE_TIMEOUT,
            tokio::process::Command::new(&self.ffmpeg_path)
                .arg("-y")
                .arg("-loglevel")
                .arg("error")
                .arg("-i")
                .arg(path)
                .args([
                    "-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p", "-c:a", "aac",
                    "-movflags", "+faststart",
                ])
                .arg(&encoded)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .context("encoder timed out")?
        .with_context(|| format!("failed to run {}", self.ffmpeg_path))?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&encoded).await;
            anyhow::bail!(
                "encoder exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        tokio::fs::rename(&encoded, path)
            .await
            .context("failed to replace original with encoded file")?;
        Ok(())
    }

    async fn try_fetch(&self, dest: &Path, url: &str, kind: MediaKind) -> crate::error::Result<()> {
        let bytes = self
            .download(url, dest)
            .await
            .map_err(|e| PagewatchError::Download(format!("{url}: {e:#}")))?;
        debug!(path = %dest.display(), bytes, "Downloaded media");
        if kind == MediaKind::Video {
            self.reencode(dest)
                .await
                .map_err(|e| PagewatchError::Download(format!("re-encode of {url} failed: {e:#}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn probe_size(&self, url: &str) -> Option<u64> {
        let resp = match self.client.head(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url, error = %e, "Size probe failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!(url, status = %resp.status(), "Size probe rejected");
            return None;
        }
        resp.headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    async fn fetch(&self, page_id: &str, url: &str, kind: MediaKind, ordinal: usize) -> Option<String> {
        let name = media_file_name(page_id, url, kind, chrono::Utc::now().timestamp_millis(), ordinal);
        let dest = self.media_dir.join(name);

        match self.try_fetch(&dest, url, kind).await {
            Ok(()) => {
                info!(page = page_id, %kind, path = %dest.display(), "Media ready");
                Some(dest.to_string_lossy().into_owned())
            }
            Err(e) => {
                warn!(page = page_id, %kind, url, error = %e, "Media download failed, dropping item");
                if let Err(rm) = tokio::fs::remove_file(&dest).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %dest.display(), error = %rm, "Failed to remove partial download");
                    }
                }
                None
            }
        }
    }
}
