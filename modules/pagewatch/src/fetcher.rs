// Page fetchers: open a page, optionally run scripts in it, read its markup.
//
// Two backends, mirroring the archive's page backends: a remote Browserless
// instance, or a local Chromium launched with --dump-dom.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use browserless_client::{BrowserlessClient, ContentRequest};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::config::PageBackend;

/// Max concurrent Chromium processes. Each instance is heavy (~100MB+ RSS).
const MAX_CONCURRENT_CHROME: usize = 2;
/// Max retry attempts for transient Chrome failures.
const CHROME_MAX_ATTEMPTS: u32 = 3;
/// Base backoff for Chrome retries. Actual delay is base * 3^attempt + jitter.
const CHROME_RETRY_BASE: Duration = Duration::from_secs(3);
const CHROME_TIMEOUT: Duration = Duration::from_secs(45);
/// Settle time Browserless gives injected scripts before serializing the DOM.
const SCRIPT_SETTLE_MS: u64 = 2_000;

/// An open page. Must be closed by the caller once markup has been read,
/// including when processing the markup fails.
#[async_trait]
pub trait PageSession: Send {
    /// Serialized DOM of the page, after any scripts have run.
    async fn markup(&mut self) -> Result<String>;

    async fn execute_script(&mut self, js: &str) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>>;

    fn name(&self) -> &str;
}

/// Build the fetcher selected by configuration.
pub fn from_backend(backend: &PageBackend) -> Result<Arc<dyn PageFetcher>> {
    Ok(match backend {
        PageBackend::Chrome { bin } => Arc::new(ChromeFetcher::new(bin)),
        PageBackend::Browserless {
            base_url,
            token,
            headless,
        } => Arc::new(BrowserlessFetcher::new(base_url, token.as_deref(), *headless)?),
    })
}

fn ensure_http(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).context("Invalid URL")?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("Only http/https URLs allowed, got: {}", parsed.scheme());
    }
    Ok(())
}

// --- Browserless ---

pub struct BrowserlessFetcher {
    client: Arc<BrowserlessClient>,
}

impl BrowserlessFetcher {
    pub fn new(base_url: &str, token: Option<&str>, headless: bool) -> Result<Self> {
        info!(base_url, headless, "BrowserlessFetcher initialized");
        let client = BrowserlessClient::new(base_url, token)
            .context("Failed to build Browserless client")?
            .headless(headless);
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl PageFetcher for BrowserlessFetcher {
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>> {
        ensure_http(url)?;
        Ok(Box::new(BrowserlessSession {
            client: self.client.clone(),
            request: ContentRequest::new(url),
        }))
    }

    fn name(&self) -> &str {
        "browserless"
    }
}

/// Browserless /content is stateless, so scripts are queued and run
/// server-side when the markup is requested.
struct BrowserlessSession {
    client: Arc<BrowserlessClient>,
    request: ContentRequest,
}

#[async_trait]
impl PageSession for BrowserlessSession {
    async fn markup(&mut self) -> Result<String> {
        info!(url = %self.request.url, fetcher = "browserless", "Fetching page");
        let html = self
            .client
            .content_with(&self.request)
            .await
            .context("Browserless content request failed")?;

        if html.is_empty() {
            warn!(url = %self.request.url, fetcher = "browserless", "Empty HTML response");
        } else {
            info!(url = %self.request.url, fetcher = "browserless", bytes = html.len(), "Fetched successfully");
        }
        Ok(html)
    }

    async fn execute_script(&mut self, js: &str) -> Result<()> {
        let request = std::mem::take(&mut self.request);
        self.request = request.with_script(js).wait_for(SCRIPT_SETTLE_MS);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// --- Local Chromium ---

pub struct ChromeFetcher {
    bin: String,
    semaphore: Arc<Semaphore>,
}

impl ChromeFetcher {
    pub fn new(bin: &str) -> Self {
        info!(bin, "ChromeFetcher initialized (max_concurrent={MAX_CONCURRENT_CHROME})");
        Self {
            bin: bin.to_string(),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_CHROME)),
        }
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>> {
        ensure_http(url)?;
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("Chrome semaphore closed"))?;

        Ok(Box::new(ChromeSession {
            bin: self.bin.clone(),
            url: url.to_string(),
            _permit: permit,
        }))
    }

    fn name(&self) -> &str {
        "chrome"
    }
}

/// Holds one of the Chromium slots until closed.
struct ChromeSession {
    bin: String,
    url: String,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn markup(&mut self) -> Result<String> {
        info!(url = %self.url, fetcher = "chrome", "Fetching page");
        let bytes = run_chrome(&self.bin, &self.url).await?;
        if bytes.is_empty() {
            warn!(url = %self.url, fetcher = "chrome", "Empty DOM output");
            return Ok(String::new());
        }
        info!(url = %self.url, fetcher = "chrome", bytes = bytes.len(), "Fetched successfully");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn execute_script(&mut self, _js: &str) -> Result<()> {
        anyhow::bail!("dump-dom backend cannot execute scripts")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Launch Chrome --dump-dom and return raw stdout bytes.
async fn run_chrome(bin: &str, url: &str) -> Result<Vec<u8>> {
    for attempt in 0..CHROME_MAX_ATTEMPTS {
        let tmp_dir = tempfile::tempdir().context("Failed to create temp profile dir")?;

        let result = tokio::time::timeout(
            CHROME_TIMEOUT,
            tokio::process::Command::new(bin)
                .args([
                    "--headless",
                    "--no-sandbox",
                    "--disable-gpu",
                    "--disable-dev-shm-usage",
                    &format!("--user-data-dir={}", tmp_dir.path().display()),
                    "--dump-dom",
                    url,
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let retry = attempt + 1 < CHROME_MAX_ATTEMPTS;
        match result {
            Ok(Ok(output)) if output.status.success() => {
                if output.stdout.is_empty() && retry {
                    warn!(url, attempt = attempt + 1, "Chrome returned empty DOM, retrying");
                    backoff(attempt).await;
                    continue;
                }
                return Ok(output.stdout);
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if is_transient_error(&stderr) && retry {
                    warn!(url, attempt = attempt + 1, "Chrome cannot fork, retrying");
                    backoff(attempt).await;
                    continue;
                }
                anyhow::bail!("Chrome exited with {} for {url}: {stderr}", output.status);
            }
            Ok(Err(e)) => {
                if is_transient_error(&e.to_string()) && retry {
                    warn!(url, attempt = attempt + 1, error = %e, "Chrome launch failed, retrying");
                    backoff(attempt).await;
                    continue;
                }
                anyhow::bail!("Failed to run Chrome for {url}: {e}");
            }
            Err(_) => {
                if retry {
                    warn!(url, attempt = attempt + 1, "Chrome timed out, retrying");
                    backoff(attempt).await;
                    continue;
                }
                anyhow::bail!("Chrome timed out after {}s for {url}", CHROME_TIMEOUT.as_secs());
            }
        }
    }

    Ok(Vec::new())
}

fn is_transient_error(msg: &str) -> bool {
    msg.contains("Cannot fork") || msg.contains("Resource temporarily unavailable")
}

async fn backoff(attempt: u32) {
    let delay = CHROME_RETRY_BASE * 3u32.pow(attempt);
    let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
    tokio::time::sleep(delay + jitter).await;
}
