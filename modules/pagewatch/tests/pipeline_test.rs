//! End-to-end page checks against in-memory fakes: no browser, no network,
//! no chat platform.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pagewatch::delivery::{DeliveryReport, MAX_ATTACHMENT_BYTES};
use pagewatch::monitor::{LinkState, Monitor, MonitorDeps, PageOutcome, OFFLINE_INTERVAL};
use pagewatch::testing::{
    feed_markup, FakeMediaFetcher, FakePageFetcher, FixedProbe, MemoryStore, RecordingNotifier,
};
use pagewatch::PageTarget;

const TEMPLATE: &str = "https://www.facebook.com/{page}";
const ALPHA_URL: &str = "https://www.facebook.com/alpha";
const ONLINE: Duration = Duration::from_secs(120);

struct Harness {
    fetcher: Arc<FakePageFetcher>,
    store: Arc<MemoryStore>,
    media: Arc<FakeMediaFetcher>,
    notifier: Arc<RecordingNotifier>,
    probe: Arc<FixedProbe>,
    monitor: Monitor,
    _dir: tempfile::TempDir,
}

fn target(page: &str, channel: &str) -> PageTarget {
    PageTarget {
        page_id: page.to_string(),
        channel_id: channel.to_string(),
    }
}

fn harness(
    targets: Vec<PageTarget>,
    fetcher: FakePageFetcher,
    store: MemoryStore,
    media: impl FnOnce(&std::path::Path) -> FakeMediaFetcher,
    notifier: RecordingNotifier,
    probe: FixedProbe,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(fetcher);
    let store = Arc::new(store);
    let media = Arc::new(media(dir.path()));
    let notifier = Arc::new(notifier);
    let probe = Arc::new(probe);

    let monitor = Monitor::new(
        targets,
        TEMPLATE,
        ONLINE,
        MonitorDeps {
            fetcher: fetcher.clone(),
            store: store.clone(),
            media: media.clone(),
            notifier: notifier.clone(),
            probe: probe.clone(),
        },
    );

    Harness {
        fetcher,
        store,
        media,
        notifier,
        probe,
        monitor,
        _dir: dir,
    }
}

fn alpha_with(markup: &str, store: MemoryStore, media: impl FnOnce(&std::path::Path) -> FakeMediaFetcher) -> Harness {
    harness(
        vec![target("alpha", "1001")],
        FakePageFetcher::new().on_page(ALPHA_URL, markup),
        store,
        media,
        RecordingNotifier::new(),
        FixedProbe::online(),
    )
}

// =========================================================================
// Scenario A: unchanged page
// =========================================================================

#[tokio::test]
async fn already_seen_post_sends_nothing_and_writes_nothing() {
    let h = alpha_with(
        &feed_markup("/posts/100", "old news", &["https://cdn.example.com/a.jpg"]),
        MemoryStore::new().with_record("alpha", Some("/posts/100"), Utc::now()),
        |dir| FakeMediaFetcher::new(dir).on_media("https://cdn.example.com/a.jpg", 50_000),
    );

    let outcome = h.monitor.check_page(&target("alpha", "1001")).await.unwrap();

    assert_eq!(outcome, PageOutcome::Unchanged);
    assert!(h.notifier.sent().is_empty());
    assert_eq!(h.store.commit_count(), 0);
    assert!(h.media.probed().is_empty(), "no media work for a seen post");
    assert!(h.media.fetched().is_empty());
}

// =========================================================================
// Scenario B: new image post
// =========================================================================

#[tokio::test]
async fn new_image_post_is_recorded_delivered_and_cleaned_up() {
    let h = alpha_with(
        &feed_markup("/posts/200", "Big news", &["https://cdn.example.com/photo.jpg"]),
        MemoryStore::new(),
        |dir| FakeMediaFetcher::new(dir).on_media("https://cdn.example.com/photo.jpg", 4096),
    );

    let outcome = h.monitor.check_page(&target("alpha", "1001")).await.unwrap();

    assert_eq!(
        outcome,
        PageOutcome::Delivered(DeliveryReport {
            attached: 1,
            skipped_oversize: 0,
            cleanup_failures: 0,
        })
    );

    let record = h.store.record("alpha").unwrap();
    assert_eq!(record.url.as_deref(), Some("/posts/200"));
    assert!(!record.timestamp.is_empty());
    assert_eq!(h.store.commit_count(), 1);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel_id, "1001");
    assert!(sent[0].notification.text.starts_with("**alpha**"));
    assert!(sent[0].notification.text.contains("Big news"));
    assert_eq!(sent[0].notification.attachments.len(), 1);
    assert_eq!(sent[0].files_present, vec![true], "file must exist while sending");

    let path = &sent[0].notification.attachments[0].path;
    assert!(!std::path::Path::new(path).exists(), "file removed after send");
}

#[tokio::test]
async fn second_cycle_on_unchanged_page_is_idempotent() {
    let h = alpha_with(
        &feed_markup("/posts/200", "Big news", &[]),
        MemoryStore::new(),
        FakeMediaFetcher::new,
    );
    let alpha = target("alpha", "1001");

    let first = h.monitor.check_page(&alpha).await.unwrap();
    let second = h.monitor.check_page(&alpha).await.unwrap();

    assert!(matches!(first, PageOutcome::Delivered(_)));
    assert_eq!(second, PageOutcome::Unchanged);
    assert_eq!(h.store.commit_count(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
}

// =========================================================================
// Scenario C: offline
// =========================================================================

#[tokio::test]
async fn offline_cycle_checks_no_pages_and_backs_off() {
    let h = harness(
        vec![target("alpha", "1001")],
        FakePageFetcher::new().on_page(ALPHA_URL, &feed_markup("/posts/1", "x", &[])),
        MemoryStore::new(),
        FakeMediaFetcher::new,
        RecordingNotifier::new(),
        FixedProbe::offline(),
    );

    let report = h.monitor.run_cycle().await;

    assert_eq!(report.state, LinkState::Offline);
    assert_eq!(report.next_delay, OFFLINE_INTERVAL);
    assert_ne!(report.next_delay, ONLINE);
    assert!(report.outcomes.is_empty());
    assert!(h.fetcher.opened().is_empty());
    assert_eq!(h.probe.checks(), 1);
}

#[tokio::test]
async fn offline_backoff_is_configurable() {
    let h = harness(
        vec![target("alpha", "1001")],
        FakePageFetcher::new(),
        MemoryStore::new(),
        FakeMediaFetcher::new,
        RecordingNotifier::new(),
        FixedProbe::offline(),
    );
    let monitor = h.monitor.with_offline_interval(Duration::from_secs(30));

    let report = monitor.run_cycle().await;

    assert_eq!(report.next_delay, Duration::from_secs(30));
    assert!(h.fetcher.opened().is_empty());
}

#[tokio::test]
async fn online_cycle_uses_configured_interval() {
    let h = alpha_with(&feed_markup("/posts/1", "x", &[]), MemoryStore::new(), FakeMediaFetcher::new);

    let report = h.monitor.run_cycle().await;

    assert_eq!(report.state, LinkState::Online);
    assert_eq!(report.next_delay, ONLINE);
    assert_eq!(report.outcomes.len(), 1);
}

// =========================================================================
// Media filtering and attachment cap
// =========================================================================

#[tokio::test]
async fn image_size_threshold_decides_download() {
    let small = "https://cdn.example.com/small.png";
    let large = "https://cdn.example.com/large.png";
    let h = alpha_with(
        &feed_markup("/posts/300", "pics", &[small, large]),
        MemoryStore::new(),
        |dir| FakeMediaFetcher::new(dir).on_media(small, 2048).on_media(large, 2049),
    );

    h.monitor.check_page(&target("alpha", "1001")).await.unwrap();

    assert_eq!(h.media.probed(), vec![small.to_string(), large.to_string()]);
    assert_eq!(h.media.fetched(), vec![large.to_string()]);
    assert_eq!(h.notifier.sent()[0].notification.attachments.len(), 1);
}

#[tokio::test]
async fn oversized_files_are_never_attached() {
    let at_cap = "https://cdn.example.com/at-cap.jpg";
    let under_cap = "https://cdn.example.com/under-cap.jpg";
    let h = alpha_with(
        &feed_markup("/posts/400", "sizes", &[at_cap, under_cap]),
        MemoryStore::new(),
        |dir| {
            FakeMediaFetcher::new(dir)
                .on_media(at_cap, MAX_ATTACHMENT_BYTES)
                .on_media(under_cap, MAX_ATTACHMENT_BYTES - 1)
        },
    );

    let outcome = h.monitor.check_page(&target("alpha", "1001")).await.unwrap();

    let sent = h.notifier.sent();
    let attachments = &sent[0].notification.attachments;
    assert_eq!(attachments.len(), 1);
    assert!(attachments[0].name.ends_with("_1.jpg"), "only the second image fits");
    assert!(matches!(
        outcome,
        PageOutcome::Delivered(DeliveryReport {
            attached: 1,
            skipped_oversize: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn failed_download_drops_item_but_post_is_delivered() {
    let broken = "https://cdn.example.com/broken.jpg";
    let h = alpha_with(
        &feed_markup("/posts/500", "partial", &[broken]),
        MemoryStore::new(),
        |dir| FakeMediaFetcher::new(dir).on_failing_media(broken, 90_000),
    );

    let outcome = h.monitor.check_page(&target("alpha", "1001")).await.unwrap();

    assert!(matches!(outcome, PageOutcome::Delivered(DeliveryReport { attached: 0, .. })));
    assert_eq!(h.store.record("alpha").unwrap().url.as_deref(), Some("/posts/500"));
    assert_eq!(h.notifier.sent().len(), 1);
}

// =========================================================================
// Link posts
// =========================================================================

#[tokio::test]
async fn link_post_sends_url_as_text_without_media() {
    let markup = r#"
        <div role="article">
          <a href="/alpha/posts/600">3h</a>
          <div data-ad-preview="message">Worth a read</div>
          <div data-testid="link-preview">
            <a href="https://l.facebook.com/l.php?u=https%3A%2F%2Fnews.example.org%2Fstory&amp;h=AT0">
              <img src="https://cdn.example.com/card.jpg">
            </a>
          </div>
        </div>"#;
    let h = alpha_with(markup, MemoryStore::new(), |dir| {
        FakeMediaFetcher::new(dir).on_media("https://cdn.example.com/card.jpg", 80_000)
    });

    h.monitor.check_page(&target("alpha", "1001")).await.unwrap();

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].notification.text,
        "**alpha**\nWorth a read\nhttps://news.example.org/story"
    );
    assert!(sent[0].notification.attachments.is_empty());
    assert!(h.media.probed().is_empty());
}

// =========================================================================
// Failure handling
// =========================================================================

#[tokio::test]
async fn rejected_delivery_keeps_files_and_is_not_retried() {
    let photo = "https://cdn.example.com/photo.jpg";
    let h = harness(
        vec![target("alpha", "1001")],
        FakePageFetcher::new().on_page(ALPHA_URL, &feed_markup("/posts/700", "x", &[photo])),
        MemoryStore::new(),
        |dir| FakeMediaFetcher::new(dir).on_media(photo, 10_000),
        RecordingNotifier::rejecting(),
        FixedProbe::online(),
    );
    let alpha = target("alpha", "1001");

    let err = h.monitor.check_page(&alpha).await.unwrap_err();
    assert!(matches!(err, pagewatch::PagewatchError::Delivery(_)));

    let sent = h.notifier.sent();
    let path = &sent[0].notification.attachments[0].path;
    assert!(std::path::Path::new(path).exists(), "undelivered media stays on disk");
    assert_eq!(h.store.record("alpha").unwrap().url.as_deref(), Some("/posts/700"));

    let again = h.monitor.check_page(&alpha).await.unwrap();
    assert_eq!(again, PageOutcome::Unchanged);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn session_is_closed_when_markup_fails() {
    let h = harness(
        vec![target("alpha", "1001")],
        FakePageFetcher::new().on_broken_page(ALPHA_URL),
        MemoryStore::new(),
        FakeMediaFetcher::new,
        RecordingNotifier::new(),
        FixedProbe::online(),
    );

    let err = h.monitor.check_page(&target("alpha", "1001")).await.unwrap_err();

    assert!(matches!(err, pagewatch::PagewatchError::Extraction(_)));
    assert_eq!(h.fetcher.opened().len(), 1);
    assert_eq!(h.fetcher.closed(), 1);
    assert_eq!(h.store.commit_count(), 0);
}

#[tokio::test]
async fn expand_script_runs_before_markup_is_read() {
    let h = alpha_with(&feed_markup("/posts/1", "x", &[]), MemoryStore::new(), FakeMediaFetcher::new);
    h.monitor.check_page(&target("alpha", "1001")).await.unwrap();
    assert_eq!(h.fetcher.scripts_run(), 1);
    assert_eq!(h.fetcher.closed(), 1);
}

#[tokio::test]
async fn refused_expand_script_still_reads_the_page() {
    let h = harness(
        vec![target("alpha", "1001")],
        FakePageFetcher::new()
            .on_page(ALPHA_URL, &feed_markup("/posts/31", "collapsed text", &[]))
            .refusing_scripts(),
        MemoryStore::new(),
        FakeMediaFetcher::new,
        RecordingNotifier::new(),
        FixedProbe::online(),
    );

    let outcome = h.monitor.check_page(&target("alpha", "1001")).await.unwrap();

    assert!(matches!(outcome, PageOutcome::Delivered(_)));
    assert_eq!(h.fetcher.scripts_run(), 1);
    assert_eq!(h.fetcher.closed(), 1);
    assert!(h.notifier.sent()[0].notification.text.contains("collapsed text"));
}

#[tokio::test]
async fn one_failing_page_does_not_affect_others() {
    let h = harness(
        vec![target("alpha", "1001"), target("ghost", "2002")],
        FakePageFetcher::new().on_page(ALPHA_URL, &feed_markup("/posts/800", "hi", &[])),
        MemoryStore::new(),
        FakeMediaFetcher::new,
        RecordingNotifier::new(),
        FixedProbe::online(),
    );

    let report = h.monitor.run_cycle().await;

    let outcome = |page: &str| {
        report
            .outcomes
            .iter()
            .find(|(p, _)| p == page)
            .map(|(_, o)| o.clone())
            .unwrap()
    };
    assert!(matches!(outcome("alpha"), PageOutcome::Delivered(_)));
    assert_eq!(outcome("ghost"), PageOutcome::Failed);
    assert!(h.store.record("ghost").is_none());
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn persistence_failure_does_not_stop_delivery() {
    let h = alpha_with(
        &feed_markup("/posts/900", "still sent", &[]),
        MemoryStore::new().failing_persist(),
        FakeMediaFetcher::new,
    );
    let alpha = target("alpha", "1001");

    let outcome = h.monitor.check_page(&alpha).await.unwrap();

    assert!(matches!(outcome, PageOutcome::Delivered(_)));
    assert_eq!(h.store.record("alpha").unwrap().url.as_deref(), Some("/posts/900"));
    assert_eq!(h.monitor.check_page(&alpha).await.unwrap(), PageOutcome::Unchanged);
}

#[tokio::test]
async fn page_without_posts_is_unchanged() {
    let h = alpha_with("<html><body>Log in to continue</body></html>", MemoryStore::new(), FakeMediaFetcher::new);
    let outcome = h.monitor.check_page(&target("alpha", "1001")).await.unwrap();
    assert_eq!(outcome, PageOutcome::Unchanged);
    assert_eq!(h.store.commit_count(), 0);
}

#[tokio::test]
async fn run_stops_on_shutdown_after_first_cycle() {
    let h = alpha_with(&feed_markup("/posts/1", "x", &[]), MemoryStore::new(), FakeMediaFetcher::new);

    tokio::time::timeout(Duration::from_secs(5), h.monitor.run(std::future::ready(())))
        .await
        .expect("monitor should stop when shutdown resolves");

    assert_eq!(h.fetcher.opened(), vec![ALPHA_URL.to_string()]);
}
