//! Search-results harvesting and article reading on top of the browsing
//! capability boundary.
//!
//! The harvester navigates a search surface, parses result entries with an
//! ordered list of selector strategies (result pages change markup over
//! time) and gates every entry through the relevance filter. The content
//! reader turns an article URL into a short description or a typed skip
//! signal.

use std::path::PathBuf;
use std::time::Duration;

use rsnw_browser::{
    retry_once_on_session_loss, BrowserError, BrowserSession, SessionFactory,
};
use rsnw_core::{CandidateRecord, RelevanceFilter};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "rsnw-harvest";

/// Result-page kind a search task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    /// Recent-news vertical, roughly the last six months.
    News,
    /// General web results, roughly the last year.
    Web,
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl HarvestError {
    pub fn is_session_fatal(&self) -> bool {
        match self {
            HarvestError::Browser(err) => err.is_session_fatal(),
        }
    }
}

/// Entry-container strategies, tried in order; the first one that matches
/// anything wins. "Nothing matched" is an empty harvest, not an error.
const ENTRY_SELECTORS: &[&str] = &["div.SoaBEf", "div.MjjYud"];

const TITLE_SELECTOR: &str = "div[role='heading']";
const LINK_SELECTOR: &str = "a[href]";
const SNIPPET_SELECTOR: &str = ".GI74Re";
const DATE_SELECTOR: &str = ".OSrXXb span";

/// Consent interstitials show up on some exit nodes; dismissing them is
/// best-effort.
const CONSENT_DISMISS_JS: &str = r#"(() => {
  const labels = ['Accept', 'Agree', '接受', '同意'];
  for (const btn of document.querySelectorAll('button')) {
    const text = (btn.textContent || '').trim();
    if (labels.some(label => text.includes(label))) { btn.click(); return true; }
  }
  return false;
})()"#;

pub struct SearchHarvester {
    filter: RelevanceFilter,
    nav_timeout: Duration,
    screenshot_dir: Option<PathBuf>,
}

impl SearchHarvester {
    pub fn new(filter: RelevanceFilter) -> Self {
        Self {
            filter,
            nav_timeout: Duration::from_secs(20),
            screenshot_dir: None,
        }
    }

    pub fn with_nav_timeout(mut self, timeout: Duration) -> Self {
        self.nav_timeout = timeout;
        self
    }

    /// Save a page screenshot into this directory when a harvest fails.
    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = Some(dir.into());
        self
    }

    /// Search request URL for a query in the requested vertical and
    /// interface language. Pinning `hl` keeps the markup predictable.
    pub fn search_url(query: &str, kind: SearchKind, lang: &str) -> String {
        let q = urlencoding::encode(query);
        match kind {
            SearchKind::News => {
                format!("https://www.google.com/search?q={q}&tbm=nws&tbs=qdr:m6&hl={lang}")
            }
            SearchKind::Web => {
                format!("https://www.google.com/search?q={q}&tbs=qdr:y&hl={lang}")
            }
        }
    }

    /// Run one search and return the relevant candidates.
    pub async fn harvest(
        &self,
        session: &mut dyn BrowserSession,
        query: &str,
        category: &str,
        kind: SearchKind,
        lang: &str,
    ) -> Result<Vec<CandidateRecord>, HarvestError> {
        let url = Self::search_url(query, kind, lang);
        info!(category, %url, "running search");

        match session.navigate(&url, self.nav_timeout).await {
            Ok(()) => {}
            Err(BrowserError::NavigationTimeout { .. }) => {
                warn!(category, "search navigation timed out, parsing partial page");
                let _ = session.execute_script("window.stop();").await;
            }
            Err(err) => {
                self.capture_failure(session, category).await;
                return Err(err.into());
            }
        }

        let _ = session.execute_script(CONSENT_DISMISS_JS).await;

        let html = match session.content().await {
            Ok(html) => html,
            Err(err) => {
                self.capture_failure(session, category).await;
                return Err(err.into());
            }
        };

        let candidates = self.parse_results(&html, category);
        info!(category, count = candidates.len(), "harvest finished");
        Ok(candidates)
    }

    /// Parse a results page. Tries each entry-selector strategy in order;
    /// a malformed entry is skipped, never aborts the batch.
    pub fn parse_results(&self, html: &str, category: &str) -> Vec<CandidateRecord> {
        let document = Html::parse_document(html);
        for strategy in ENTRY_SELECTORS {
            let Ok(selector) = Selector::parse(strategy) else {
                continue;
            };
            let entries: Vec<ElementRef<'_>> = document.select(&selector).collect();
            if entries.is_empty() {
                continue;
            }
            debug!(strategy, entries = entries.len(), "selector strategy matched");
            return entries
                .into_iter()
                .filter_map(|entry| self.extract_entry(entry, category))
                .collect();
        }
        debug!(category, "no selector strategy matched");
        Vec::new()
    }

    fn extract_entry(&self, entry: ElementRef<'_>, category: &str) -> Option<CandidateRecord> {
        let title = first_text(entry, TITLE_SELECTOR)?;
        let url = first_attr(entry, LINK_SELECTOR, "href")?;
        let snippet = first_text(entry, SNIPPET_SELECTOR);
        let date_raw = first_text(entry, DATE_SELECTOR).unwrap_or_else(|| "Today".to_string());

        if !self
            .filter
            .is_relevant(&title, snippet.as_deref().unwrap_or(""))
        {
            debug!(%title, "rejected by relevance filter");
            return None;
        }

        Some(CandidateRecord {
            title,
            url,
            date_raw,
            source: category.to_string(),
            snippet,
        })
    }

    async fn capture_failure(&self, session: &mut dyn BrowserSession, category: &str) {
        let Some(dir) = &self.screenshot_dir else {
            return;
        };
        let slug: String = category
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let path = dir.join(format!("harvest-{slug}.png"));
        if session.screenshot(&path).await.is_ok() {
            warn!(path = %path.display(), "saved failure screenshot");
        }
    }
}

/// Outcome of reading one article URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Text(String),
    Skip(SkipSignal),
}

/// Sentinel meaning "no usable body text from this URL", distinct from a
/// successful-but-short read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipSignal {
    NotFound,
    NonTextDocument,
    Unreadable,
}

/// File extensions the reader refuses without touching the network.
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx", "zip", "rar",
];

/// Error-page lexicon, both interface languages, matched against the page
/// title and the head of the body text.
const ERROR_PAGE_MARKERS: &[&str] = &[
    "404",
    "not found",
    "forbidden",
    "access denied",
    "connection refused",
    "err_connection",
    "找不到",
    "拒絕存取",
    "無法連上",
    "發生錯誤",
];

pub struct ContentReader {
    nav_timeout: Duration,
    max_chars: usize,
    min_paragraph_chars: usize,
    error_probe_chars: usize,
}

impl Default for ContentReader {
    fn default() -> Self {
        Self {
            nav_timeout: Duration::from_secs(15),
            max_chars: 300,
            min_paragraph_chars: 30,
            error_probe_chars: 500,
        }
    }
}

impl ContentReader {
    pub fn with_nav_timeout(mut self, timeout: Duration) -> Self {
        self.nav_timeout = timeout;
        self
    }

    /// Read one URL. Never fails: transport problems degrade to
    /// [`SkipSignal::Unreadable`] after at most one session restart. The
    /// session is passed by value so a restarted replacement can be handed
    /// back.
    pub async fn read(
        &self,
        factory: &dyn SessionFactory,
        session: Box<dyn BrowserSession>,
        url: &str,
    ) -> (Box<dyn BrowserSession>, ReadOutcome) {
        if is_document_url(url) {
            debug!(url, "skipping non-text document");
            return (session, ReadOutcome::Skip(SkipSignal::NonTextDocument));
        }

        let (session, result) = retry_once_on_session_loss(
            factory,
            session,
            |err: &BrowserError| err.is_session_fatal(),
            |mut s| async move {
                let outcome = self.read_page(s.as_mut(), url).await;
                (s, outcome)
            },
        )
        .await;

        match result {
            Ok(outcome) => (session, outcome),
            Err(err) => {
                warn!(url, error = %err, "article read failed, marking unreadable");
                (session, ReadOutcome::Skip(SkipSignal::Unreadable))
            }
        }
    }

    async fn read_page(
        &self,
        session: &mut dyn BrowserSession,
        url: &str,
    ) -> Result<ReadOutcome, BrowserError> {
        match session.navigate(url, self.nav_timeout).await {
            Ok(()) => {}
            Err(BrowserError::NavigationTimeout { .. }) => {
                // Partial content is acceptable; stop loading and extract
                // whatever arrived.
                debug!(url, "navigation timed out, using partial content");
                let _ = session.execute_script("window.stop();").await;
            }
            Err(err) => return Err(err),
        }

        let title = session.title().await?;
        let body = session.page_text().await?;
        let probe: String = body.chars().take(self.error_probe_chars).collect();
        if looks_like_error_page(&title, &probe) {
            debug!(url, %title, "error page detected");
            return Ok(ReadOutcome::Skip(SkipSignal::NotFound));
        }

        let html = session.content().await?;
        Ok(ReadOutcome::Text(self.extract_summary(&html, &body)))
    }

    fn extract_summary(&self, html: &str, page_text: &str) -> String {
        let document = Html::parse_document(html);
        let mut parts: Vec<String> = Vec::new();
        if let Ok(selector) = Selector::parse("p") {
            for node in document.select(&selector) {
                let text = node.text().collect::<String>().trim().to_string();
                if text.chars().count() > self.min_paragraph_chars {
                    parts.push(text);
                }
            }
        }
        let joined = if parts.is_empty() {
            normalize_whitespace(page_text)
        } else {
            parts.join(" ")
        };
        truncate_chars(&joined, self.max_chars)
    }
}

fn is_document_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let Some((_, extension)) = path.rsplit_once('.') else {
        return false;
    };
    let extension = extension.to_ascii_lowercase();
    DOCUMENT_EXTENSIONS.iter().any(|ext| *ext == extension)
}

fn looks_like_error_page(title: &str, probe: &str) -> bool {
    let haystack = format!("{} {}", title, probe).to_lowercase();
    ERROR_PAGE_MARKERS
        .iter()
        .any(|marker| haystack.contains(marker))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max).collect();
    truncated.push_str("...");
    truncated
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(scope: ElementRef<'_>, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}
