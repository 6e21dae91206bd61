// Monitoring loop.
//
// Each cycle probes connectivity first. Online: every page is checked
// concurrently and the cycle settles only when all checks have. Offline: no
// page is touched and the next cycle waits the fixed backoff. A panicking
// cycle is treated like an offline one, so the loop never dies.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::connectivity::ConnectivityProbe;
use crate::delivery::{self, DeliveryReport, Notifier};
use crate::error::{PagewatchError, Result};
use crate::extractor::{PostExtractor, EXPAND_SCRIPT};
use crate::fetcher::{PageFetcher, PageSession};
use crate::media::MediaFetcher;
use crate::store::PostStore;
use crate::types::PageTarget;

/// Wait between cycles while no probe endpoint is reachable.
pub const OFFLINE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// No post on the page, or its newest post was already seen.
    Unchanged,
    Delivered(DeliveryReport),
    Failed,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub state: LinkState,
    pub outcomes: Vec<(String, PageOutcome)>,
    pub next_delay: Duration,
}

impl CycleReport {
    fn count(&self, pred: impl Fn(&PageOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// The ports a monitor drives.
pub struct MonitorDeps {
    pub fetcher: Arc<dyn PageFetcher>,
    pub store: Arc<dyn PostStore>,
    pub media: Arc<dyn MediaFetcher>,
    pub notifier: Arc<dyn Notifier>,
    pub probe: Arc<dyn ConnectivityProbe>,
}

pub struct Monitor {
    targets: Vec<PageTarget>,
    page_url_template: String,
    online_interval: Duration,
    offline_interval: Duration,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn PostStore>,
    extractor: PostExtractor,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn ConnectivityProbe>,
}

impl Monitor {
    pub fn new(
        targets: Vec<PageTarget>,
        page_url_template: &str,
        online_interval: Duration,
        deps: MonitorDeps,
    ) -> Self {
        Self {
            targets,
            page_url_template: page_url_template.to_string(),
            online_interval,
            offline_interval: OFFLINE_INTERVAL,
            fetcher: deps.fetcher,
            extractor: PostExtractor::new(deps.store.clone(), deps.media),
            store: deps.store,
            notifier: deps.notifier,
            probe: deps.probe,
        }
    }

    pub fn with_offline_interval(mut self, interval: Duration) -> Self {
        self.offline_interval = interval;
        self
    }

    /// Run cycles until `shutdown` resolves. The first cycle starts immediately.
    pub async fn run<F: Future>(&self, shutdown: F) {
        tokio::pin!(shutdown);
        info!(
            pages = self.targets.len(),
            interval_secs = self.online_interval.as_secs(),
            "Monitor started"
        );

        loop {
            let delay = match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(report) => {
                    if report.state == LinkState::Online {
                        info!(
                            checked = report.outcomes.len(),
                            delivered = report.count(|o| matches!(o, PageOutcome::Delivered(_))),
                            failed = report.count(|o| *o == PageOutcome::Failed),
                            next_in_secs = report.next_delay.as_secs(),
                            "Cycle complete"
                        );
                    }
                    report.next_delay
                }
                Err(_) => {
                    error!("Monitor cycle panicked, backing off");
                    self.offline_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, monitor stopping");
                    break;
                }
            }
        }
    }

    /// One cycle: probe, then check every page jointly.
    pub async fn run_cycle(&self) -> CycleReport {
        if let Err(e) = self.probe.check().await {
            warn!(
                error = %e,
                retry_in_secs = self.offline_interval.as_secs(),
                "Offline, skipping page checks"
            );
            return CycleReport {
                state: LinkState::Offline,
                outcomes: Vec::new(),
                next_delay: self.offline_interval,
            };
        }

        let outcomes = futures::future::join_all(self.targets.iter().map(|target| async move {
            let outcome = match self.check_page(target).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(page = %target.page_id, error = %e, "Page check failed");
                    PageOutcome::Failed
                }
            };
            (target.page_id.clone(), outcome)
        }))
        .await;

        CycleReport {
            state: LinkState::Online,
            outcomes,
            next_delay: self.online_interval,
        }
    }

    /// Fetch, extract, record, deliver. Strictly sequential for one page.
    ///
    /// The post is recorded as seen before delivery, so a rejected delivery
    /// is not retried on the next cycle.
    pub async fn check_page(&self, target: &PageTarget) -> Result<PageOutcome> {
        let page = target.page_id.as_str();
        let url = crate::config::render_page_url(&self.page_url_template, page);
        let markup = self.fetch_markup(&url).await?;

        let Some(post) = self.extractor.extract(&markup, page).await else {
            return Ok(PageOutcome::Unchanged);
        };

        if let Err(e) = self
            .store
            .commit(page, post.canonical_url.as_deref(), post.observed_at)
            .await
        {
            warn!(page, error = %e, "Failed to persist seen post, keeping in-memory state");
        }

        let report = delivery::deliver(self.notifier.as_ref(), target, &post).await?;
        Ok(PageOutcome::Delivered(report))
    }

    /// Open a session, read the markup, and close the session whatever happened.
    async fn fetch_markup(&self, url: &str) -> Result<String> {
        debug!(url, fetcher = self.fetcher.name(), "Opening page session");
        let mut session = self
            .fetcher
            .open(url)
            .await
            .map_err(|e| PagewatchError::Extraction(format!("failed to open {url}: {e:#}")))?;

        let markup = read_markup(session.as_mut(), url).await;

        if let Err(e) = session.close().await {
            warn!(url, error = %e, "Failed to close page session");
        }
        markup
    }
}

async fn read_markup(session: &mut dyn PageSession, url: &str) -> Result<String> {
    if let Err(e) = session.execute_script(EXPAND_SCRIPT).await {
        warn!(url, error = %e, "Expand script failed, continuing with collapsed text");
    }
    session
        .markup()
        .await
        .map_err(|e| PagewatchError::Extraction(format!("failed to read {url}: {e:#}")))
}
