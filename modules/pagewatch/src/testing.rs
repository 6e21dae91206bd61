// Deterministic fakes for every port:
// - FakePageFetcher (PageFetcher): HashMap URL→markup, tracks open/close
// - MemoryStore (PostStore): in-memory records, counts commits
// - FakeMediaFetcher (MediaFetcher): reported sizes, writes real files
// - RecordingNotifier (Notifier): records messages, can reject
// - FixedProbe (ConnectivityProbe): always online or always offline
//
// No network, no browser, no chat platform.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::connectivity::ConnectivityProbe;
use crate::delivery::{Notification, Notifier, SentMessage};
use crate::error::PagewatchError;
use crate::fetcher::{PageFetcher, PageSession};
use crate::media::MediaFetcher;
use crate::store::{format_timestamp, PostStore};
use crate::types::{MediaKind, SeenPostRecord};

// ---------------------------------------------------------------------------
// FakePageFetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionLog {
    opened: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

/// Serves registered markup per URL. Unregistered URLs fail to open;
/// URLs registered with `on_broken_page` open but fail to produce markup.
#[derive(Default)]
pub struct FakePageFetcher {
    pages: HashMap<String, String>,
    broken: HashSet<String>,
    refuse_scripts: bool,
    log: Arc<SessionLog>,
}

impl FakePageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page(mut self, url: &str, markup: &str) -> Self {
        self.pages.insert(url.to_string(), markup.to_string());
        self
    }

    pub fn on_broken_page(mut self, url: &str) -> Self {
        self.broken.insert(url.to_string());
        self
    }

    /// Sessions fail every script, like a backend that only dumps the DOM.
    pub fn refusing_scripts(mut self) -> Self {
        self.refuse_scripts = true;
        self
    }

    pub fn opened(&self) -> Vec<String> {
        self.log.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.log.closed.load(Ordering::SeqCst)
    }

    pub fn scripts_run(&self) -> usize {
        self.log.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl PageFetcher for FakePageFetcher {
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>> {
        let markup = if self.broken.contains(url) {
            None
        } else {
            match self.pages.get(url) {
                Some(markup) => Some(markup.clone()),
                None => bail!("FakePageFetcher: no page registered for {url}"),
            }
        };
        self.log.opened.lock().unwrap().push(url.to_string());
        Ok(Box::new(FakeSession {
            markup,
            refuse_scripts: self.refuse_scripts,
            log: self.log.clone(),
        }))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct FakeSession {
    markup: Option<String>,
    refuse_scripts: bool,
    log: Arc<SessionLog>,
}

#[async_trait]
impl PageSession for FakeSession {
    async fn markup(&mut self) -> Result<String> {
        match &self.markup {
            Some(markup) => Ok(markup.clone()),
            None => bail!("FakeSession: page crashed"),
        }
    }

    async fn execute_script(&mut self, js: &str) -> Result<()> {
        self.log.scripts.lock().unwrap().push(js.to_string());
        if self.refuse_scripts {
            bail!("FakeSession: scripts unsupported");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SeenPostRecord>>,
    commits: AtomicUsize,
    fail_persist: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, page_id: &str, url: Option<&str>, timestamp: DateTime<Utc>) -> Self {
        self.records.lock().unwrap().insert(
            page_id.to_string(),
            SeenPostRecord {
                url: url.map(String::from),
                timestamp: format_timestamp(timestamp),
            },
        );
        self
    }

    /// Every commit reports a persistence failure (memory still updates).
    pub fn failing_persist(mut self) -> Self {
        self.fail_persist = true;
        self
    }

    pub fn record(&self, page_id: &str) -> Option<SeenPostRecord> {
        self.records.lock().unwrap().get(page_id).cloned()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn last_seen(&self, page_id: &str) -> Option<SeenPostRecord> {
        self.record(page_id)
    }

    async fn commit(
        &self,
        page_id: &str,
        url: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> crate::error::Result<()> {
        self.records.lock().unwrap().insert(
            page_id.to_string(),
            SeenPostRecord {
                url: url.map(String::from),
                timestamp: format_timestamp(timestamp),
            },
        );
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_persist {
            return Err(PagewatchError::Persistence("disk full".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeMediaFetcher
// ---------------------------------------------------------------------------

/// Reports registered sizes on probe and writes files of the registered
/// size on fetch. Unregistered URLs probe as unknown and fail to fetch.
pub struct FakeMediaFetcher {
    dir: PathBuf,
    sizes: HashMap<String, u64>,
    failing: HashSet<String>,
    probes: Mutex<Vec<String>>,
    fetches: Mutex<Vec<String>>,
}

impl FakeMediaFetcher {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            sizes: HashMap::new(),
            failing: HashSet::new(),
            probes: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn on_media(mut self, url: &str, size: u64) -> Self {
        self.sizes.insert(url.to_string(), size);
        self
    }

    /// Probe reports the size but the download fails.
    pub fn on_failing_media(mut self, url: &str, size: u64) -> Self {
        self.sizes.insert(url.to_string(), size);
        self.failing.insert(url.to_string());
        self
    }

    pub fn probed(&self) -> Vec<String> {
        self.probes.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaFetcher for FakeMediaFetcher {
    async fn probe_size(&self, url: &str) -> Option<u64> {
        self.probes.lock().unwrap().push(url.to_string());
        self.sizes.get(url).copied()
    }

    async fn fetch(&self, page_id: &str, url: &str, kind: MediaKind, ordinal: usize) -> Option<String> {
        self.fetches.lock().unwrap().push(url.to_string());
        let size = *self.sizes.get(url)?;
        if self.failing.contains(url) {
            return None;
        }

        let path = self.dir.join(crate::media::media_file_name(page_id, url, kind, 0, ordinal));
        let file = std::fs::File::create(&path).ok()?;
        // Sparse file: large sizes cost nothing on disk.
        file.set_len(size).ok()?;
        Some(path.to_string_lossy().into_owned())
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub channel_id: String,
    pub notification: Notification,
    /// Whether each attachment's file existed at the moment of sending.
    pub files_present: Vec<bool>,
}

#[derive(Default)]
pub struct RecordingNotifier {
    reject: bool,
    sent: Mutex<Vec<SentRecord>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, channel_id: &str, notification: &Notification) -> crate::error::Result<SentMessage> {
        let files_present = notification
            .attachments
            .iter()
            .map(|a| Path::new(&a.path).exists())
            .collect();
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentRecord {
            channel_id: channel_id.to_string(),
            notification: notification.clone(),
            files_present,
        });
        if self.reject {
            return Err(PagewatchError::Delivery("403: Missing Access".to_string()));
        }
        Ok(SentMessage {
            id: format!("msg-{}", sent.len()),
        })
    }
}

// ---------------------------------------------------------------------------
// FixedProbe
// ---------------------------------------------------------------------------

pub struct FixedProbe {
    online: bool,
    checks: AtomicUsize,
}

impl FixedProbe {
    pub fn online() -> Self {
        Self {
            online: true,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for FixedProbe {
    async fn check(&self) -> crate::error::Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.online {
            Ok(())
        } else {
            Err(PagewatchError::Connectivity)
        }
    }
}

// ---------------------------------------------------------------------------
// Markup helpers
// ---------------------------------------------------------------------------

/// A feed whose newest post links to `permalink` with `text` and `images`.
pub fn feed_markup(permalink: &str, text: &str, images: &[&str]) -> String {
    let imgs: String = images
        .iter()
        .map(|src| format!(r#"<img src="{src}">"#))
        .collect();
    format!(
        r#"<html><body><div role="feed">
            <div role="article">
              <a href="{permalink}">1h</a>
              <div data-ad-preview="message">{text}</div>
              {imgs}
            </div>
            <div role="article"><a href="/older/posts/1">2d</a></div>
        </div></body></html>"#
    )
}
