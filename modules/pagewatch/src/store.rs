// Change-detection store: page identifier → last seen post.
//
// The JSON file mirrors the in-memory map and is rewritten in full on every
// commit (temp file + rename). Commits are serialized so two pages
// finishing at once never interleave their writes.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{PagewatchError, Result};
use crate::types::SeenPostRecord;

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn last_seen(&self, page_id: &str) -> Option<SeenPostRecord>;

    /// Record the newest post of a page. The in-memory view is updated even
    /// when persisting fails; the error is returned for the caller to log.
    async fn commit(&self, page_id: &str, url: Option<&str>, timestamp: DateTime<Utc>) -> Result<()>;

    async fn is_novel(&self, page_id: &str, url: Option<&str>) -> bool {
        is_novel_against(self.last_seen(page_id).await.as_ref(), url)
    }
}

/// A post is novel unless the page's stored URL is the same.
pub fn is_novel_against(record: Option<&SeenPostRecord>, url: Option<&str>) -> bool {
    match record {
        Some(record) => record.url.as_deref() != url,
        None => true,
    }
}

/// ISO-8601 form used in the state file.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// On-disk layout: `{ "posts": { "<page>": { "url": ..., "timestamp": ... } } }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    posts: BTreeMap<String, SeenPostRecord>,
}

pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<HashMap<String, SeenPostRecord>>,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Load the state file. A missing file is an empty store; a file that
    /// exists but cannot be parsed is an error, so a corrupt state never
    /// silently re-announces every page.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let state: StateFile = serde_json::from_str(&raw).map_err(|e| {
                    PagewatchError::Persistence(format!("{} is not a valid state file: {e}", path.display()))
                })?;
                info!(path = %path.display(), pages = state.posts.len(), "Loaded seen-post state");
                state.posts.into_iter().collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file yet, starting empty");
                HashMap::new()
            }
            Err(e) => {
                return Err(PagewatchError::Persistence(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let state = StateFile {
            posts: self
                .records
                .read()
                .await
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&state)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &body))
            .await
            .context("state writer task failed")??;
        Ok(())
    }
}

fn write_atomically(path: &Path, body: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl PostStore for JsonFileStore {
    async fn last_seen(&self, page_id: &str) -> Option<SeenPostRecord> {
        self.records.read().await.get(page_id).cloned()
    }

    async fn commit(&self, page_id: &str, url: Option<&str>, timestamp: DateTime<Utc>) -> Result<()> {
        let record = SeenPostRecord {
            url: url.map(String::from),
            timestamp: format_timestamp(timestamp),
        };
        self.records.write().await.insert(page_id.to_string(), record);
        debug!(page = page_id, url = ?url, "Committed seen post");

        self.persist()
            .await
            .map_err(|e| PagewatchError::Persistence(format!("{}: {e:#}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::load(dir.path().join("posts.json")).await.unwrap();
        assert!(store.last_seen("alpha").await.is_none());
        assert!(store.is_novel("alpha", Some("/posts/1")).await);
    }

    #[tokio::test]
    async fn commit_writes_whole_file_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("posts.json");

        let store = JsonFileStore::load(&path).await.unwrap();
        store.commit("alpha", Some("/posts/200"), ts()).await.unwrap();
        store.commit("beta", None, ts()).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["posts"]["alpha"]["url"], "/posts/200");
        assert_eq!(json["posts"]["alpha"]["timestamp"], "2024-05-01T12:30:00.000Z");
        assert!(json["posts"]["beta"]["url"].is_null());

        let reloaded = JsonFileStore::load(&path).await.unwrap();
        let record = reloaded.last_seen("alpha").await.unwrap();
        assert_eq!(record.url.as_deref(), Some("/posts/200"));
        assert!(!reloaded.is_novel("alpha", Some("/posts/200")).await);
        assert!(reloaded.is_novel("alpha", Some("/posts/201")).await);
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFileStore::load(&path).await.err().unwrap();
        assert!(matches!(err, PagewatchError::Persistence(_)));
    }

    #[tokio::test]
    async fn failed_write_still_updates_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the state file should be makes the rename fail.
        let path = dir.path().join("posts.json");
        std::fs::create_dir(&path).unwrap();

        let store = JsonFileStore {
            path: path.clone(),
            records: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        };
        let err = store.commit("alpha", Some("/posts/9"), ts()).await.unwrap_err();
        assert!(matches!(err, PagewatchError::Persistence(_)));
        assert_eq!(
            store.last_seen("alpha").await.unwrap().url.as_deref(),
            Some("/posts/9")
        );
    }

    #[tokio::test]
    async fn legacy_file_without_posts_key_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.json");
        std::fs::write(&path, "{}").unwrap();
        let store = JsonFileStore::load(&path).await.unwrap();
        assert!(store.last_seen("alpha").await.is_none());
    }
}
