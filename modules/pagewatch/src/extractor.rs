// Post extraction from rendered page markup.
//
// Parsing is synchronous and finishes before any await: `scraper::Html` is
// not Send, so the document never lives across a suspension point. The
// async half (`PostExtractor::extract`) only deals with owned results.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, info};

use crate::media::{image_qualifies, MediaFetcher};
use crate::store::{is_novel_against, PostStore};
use crate::types::{EmbeddedLink, ExtractedPost, MediaItem, MediaKind, MediaRef, PostOutline};
use crate::url_normalizer::{is_http_url, normalize};

/// Clicks every collapsed "See more" toggle so the message text is complete
/// when the DOM is captured.
pub const EXPAND_SCRIPT: &str = r#"
(() => {
  const labels = ["see more", "voir plus", "ver más", "mehr ansehen"];
  document.querySelectorAll('div[role="button"], span[role="button"]').forEach((el) => {
    const text = (el.innerText || "").trim().toLowerCase();
    if (labels.includes(text)) {
      try { el.click(); } catch (_) {}
    }
  });
})();
"#;

/// Downloads run a few at a time; results keep markup order.
const MEDIA_CONCURRENCY: usize = 3;

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static POST: LazyLock<Selector> =
    LazyLock::new(|| selector("[role='article'], article, [data-pagelet^='FeedUnit']"));
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| selector("a[href]"));
static IMG: LazyLock<Selector> = LazyLock::new(|| selector("img[src]"));
static VIDEO: LazyLock<Selector> = LazyLock::new(|| selector("video"));
static VIDEO_SOURCE: LazyLock<Selector> = LazyLock::new(|| selector("source[src]"));
static MESSAGE: LazyLock<Selector> = LazyLock::new(|| {
    selector(
        "[data-ad-preview='message'], [data-ad-comet-preview='message'], [data-testid='post_message']",
    )
});

/// Link-preview cards, tried in order; the first selector that matches wins.
static LINK_PREVIEW: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "[data-testid='link-preview']",
        "[data-link-preview]",
        "[data-lynx-uri]",
        "a[href*='l.facebook.com/l.php']",
        "a[href*='lm.facebook.com/l.php']",
    ]
    .iter()
    .map(|css| selector(css))
    .collect()
});

/// Attributes that carry a preview card's destination directly.
const LINK_DATA_ATTRS: &[&str] = &["data-lynx-uri", "data-href", "data-url"];

static PERMALINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:posts|permalink|videos|photos|reel)/[^/?#]+").expect("valid regex")
});
/// A toggle label left at the end of the text: after an ellipsis or alone on its line.
static SEE_MORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:…|\.\.\.|(?:^|\n))[ \t]*see (?:more|less)\s*$").expect("valid regex")
});

const BLOCK_TAGS: &[&str] = &["p", "div", "li", "blockquote", "h1", "h2", "h3", "h4"];

/// Result of scanning markup for the newest post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    NoPost,
    /// The newest post is the one already recorded for this page.
    AlreadySeen { url: Option<String> },
    Post(PostOutline),
}

/// Locate the newest post and describe it.
///
/// `is_novel` is consulted as soon as the permalink is known; a post that is
/// not novel short-circuits before previews and media are looked at.
pub fn scan(markup: &str, is_novel: impl Fn(Option<&str>) -> bool) -> Scan {
    let document = Html::parse_document(markup);
    let Some(post) = document.select(&POST).next() else {
        return Scan::NoPost;
    };

    let canonical_url = permalink(post);
    if !is_novel(canonical_url.as_deref()) {
        return Scan::AlreadySeen { url: canonical_url };
    }

    let text = post
        .select(&MESSAGE)
        .next()
        .map(element_text)
        .unwrap_or_default();

    let embedded_link = embedded_link(post);
    let media = if embedded_link.is_some() {
        Vec::new()
    } else {
        media_refs(post)
    };

    Scan::Post(PostOutline {
        canonical_url,
        text,
        embedded_link,
        media,
    })
}

/// First permalink-shaped anchor in the post, query string and fragment removed.
fn permalink(post: ElementRef<'_>) -> Option<String> {
    post.select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| PERMALINK_RE.is_match(strip_query(href)))
        .map(|href| strip_query(href).to_string())
}

fn strip_query(href: &str) -> &str {
    href.split(['?', '#']).next().unwrap_or(href)
}

fn embedded_link(post: ElementRef<'_>) -> Option<EmbeddedLink> {
    // Links typed into the caption are part of the text, not a preview card.
    let card = LINK_PREVIEW
        .iter()
        .find_map(|sel| post.select(sel).find(|el| !in_message(*el)))?;

    let from_card = raw_card_link(card).map(normalize);
    let url = match from_card {
        Some(url) if is_http_url(&url) => Some(url),
        _ => image_anchor(card).map(normalize).filter(|u| is_http_url(u)),
    };

    match url {
        Some(url) => Some(EmbeddedLink { url }),
        None => {
            debug!("Link preview found but no usable URL");
            None
        }
    }
}

fn in_message(el: ElementRef<'_>) -> bool {
    MESSAGE.matches(&el)
        || el
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| MESSAGE.matches(&a))
}

/// Destination of a preview card: data attribute, then its own or a nested
/// anchor, then an enclosing anchor.
fn raw_card_link<'a>(card: ElementRef<'a>) -> Option<&'a str> {
    let data_attr = LINK_DATA_ATTRS
        .iter()
        .find_map(|attr| card.value().attr(attr))
        .filter(|v| !v.trim().is_empty());

    data_attr
        .or_else(|| own_href(card))
        .or_else(|| card.select(&ANCHOR).find_map(own_href))
        .or_else(|| card.ancestors().filter_map(ElementRef::wrap).find_map(own_href))
}

fn own_href<'a>(el: ElementRef<'a>) -> Option<&'a str> {
    (el.value().name() == "a")
        .then(|| el.value().attr("href"))
        .flatten()
}

/// An anchor inside the card that wraps an image (the card thumbnail).
fn image_anchor<'a>(card: ElementRef<'a>) -> Option<&'a str> {
    card.select(&ANCHOR)
        .find(|a| a.select(&IMG).next().is_some())
        .and_then(own_href)
}

/// At most one video, then every distinct http(s) image, in markup order.
fn media_refs(post: ElementRef<'_>) -> Vec<MediaRef> {
    let mut refs = Vec::new();

    if let Some(video) = post.select(&VIDEO).next() {
        let src = video
            .value()
            .attr("src")
            .filter(|s| is_http_url(s))
            .or_else(|| {
                video
                    .select(&VIDEO_SOURCE)
                    .filter_map(|s| s.value().attr("src"))
                    .find(|s| is_http_url(s))
            });
        match src {
            Some(src) => refs.push(MediaRef {
                kind: MediaKind::Video,
                source_url: src.to_string(),
            }),
            None => debug!("Video element has no downloadable source"),
        }
    }

    let mut seen = HashSet::new();
    for src in post.select(&IMG).filter_map(|img| img.value().attr("src")) {
        if is_http_url(src) && seen.insert(src) {
            refs.push(MediaRef {
                kind: MediaKind::Image,
                source_url: src.to_string(),
            });
        }
    }

    refs
}

/// Visible text of an element with line breaks kept for `<br>` and block
/// elements. Buttons (the "See more" toggle among them) are skipped.
fn element_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(el, &mut out);
    clean_text(&out)
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(e) if e.name() == "br" => out.push('\n'),
            Node::Element(e) if e.attr("role") == Some("button") => {}
            Node::Element(e) => {
                if BLOCK_TAGS.contains(&e.name()) && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, out);
                }
            }
            _ => {}
        }
    }
}

/// Collapse whitespace per line, keep at most one blank line between
/// paragraphs, and drop a trailing "See more"/"See less" toggle.
pub fn clean_text(raw: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in raw.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }

    let joined = lines.join("\n");
    SEE_MORE_RE.replace(joined.trim(), "").trim().to_string()
}

/// Turns page markup into an `ExtractedPost`, consulting the store for
/// novelty and downloading qualifying media.
pub struct PostExtractor {
    store: Arc<dyn PostStore>,
    media: Arc<dyn MediaFetcher>,
}

impl PostExtractor {
    pub fn new(store: Arc<dyn PostStore>, media: Arc<dyn MediaFetcher>) -> Self {
        Self { store, media }
    }

    /// `None` when the page has no post or its newest post was already seen.
    /// In the second case nothing is downloaded.
    pub async fn extract(&self, markup: &str, page_id: &str) -> Option<ExtractedPost> {
        let last_seen = self.store.last_seen(page_id).await;

        let outline = match scan(markup, |url| is_novel_against(last_seen.as_ref(), url)) {
            Scan::NoPost => {
                info!(page = page_id, "No post found in markup");
                return None;
            }
            Scan::AlreadySeen { url } => {
                debug!(page = page_id, url = ?url, "Newest post already seen");
                return None;
            }
            Scan::Post(outline) => outline,
        };

        info!(
            page = page_id,
            url = ?outline.canonical_url,
            link = outline.embedded_link.is_some(),
            media = outline.media.len(),
            "New post found"
        );

        let media = self.resolve_media(page_id, &outline.media).await;

        Some(ExtractedPost {
            canonical_url: outline.canonical_url,
            text: outline.text,
            embedded_link: outline.embedded_link,
            media,
            observed_at: Utc::now(),
        })
    }

    /// Download every qualifying media reference. Images must be larger than
    /// the icon threshold; failed downloads stay in the list with no path.
    async fn resolve_media(&self, page_id: &str, refs: &[MediaRef]) -> Vec<MediaItem> {
        let media = &self.media;

        futures::stream::iter(refs.iter().enumerate())
            .map(|(ordinal, r)| async move {
                if r.kind == MediaKind::Image {
                    let size = media.probe_size(&r.source_url).await;
                    if !image_qualifies(size) {
                        debug!(page = page_id, url = %r.source_url, size = ?size, "Skipping small or unsized image");
                        return None;
                    }
                }
                let local_path = media.fetch(page_id, &r.source_url, r.kind, ordinal).await;
                Some(MediaItem {
                    kind: r.kind,
                    local_path,
                })
            })
            .buffered(MEDIA_CONCURRENCY)
            .filter_map(|item| async move { item })
            .collect()
            .await
    }
}
