//! Orchestration: the ingestion and submission pipelines, the external-form
//! driver, and the deadline supervisor that wraps a whole run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Local, Utc};
use rsnw_browser::{retry_once_on_session_loss, BrowserSession, SessionFactory};
use rsnw_core::{
    normalize_date, CandidateRecord, CapturedBatch, CleanedRecord, NewsItem, RelevanceFilter,
    NO_SUMMARY_PLACEHOLDER, SNIPPET_PREFIX,
};
use rsnw_harvest::{ContentReader, HarvestError, ReadOutcome, SearchHarvester, SearchKind};
use rsnw_storage::NewsStore;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rsnw-pipeline";

/// Exit code used by the supervisor's forced-termination path.
pub const KILL_EXIT_CODE: i32 = 2;

/// Number of short-answer fields the external form must expose, in order:
/// title, url, publish date, source, capture timestamp.
const FORM_TEXT_FIELDS: usize = 5;

/// The form rejects over-long paragraph answers.
const DESCRIPTION_LIMIT: usize = 500;

/// An article body shorter than this is considered unusable and the
/// search snippet is preferred.
const MIN_USABLE_BODY_CHARS: usize = 30;

/// Localized acknowledgment phrases shown after a successful submission.
const ACK_MARKERS: &[&str] = &["已記錄", "recorded"];

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Target form URL; submission refuses to start without it.
    pub form_url: Option<String>,
    pub searches_path: PathBuf,
    /// Wall-clock limit for a whole run before the forced kill.
    pub deadline: Duration,
    /// Candidates kept per search task.
    pub max_per_source: usize,
    pub source_pause: Duration,
    pub item_pause: Duration,
    /// Accept a post-submit URL change as a success signal when no
    /// acknowledgment phrase appears.
    pub lenient_url_change: bool,
    /// Fixed UTC offset applied to the capture timestamp.
    pub tz_offset_hours: i32,
    pub screenshot_dir: Option<PathBuf>,
}

impl WatcherConfig {
    pub fn from_env() -> Self {
        Self {
            form_url: std::env::var("RSNW_FORM_URL").ok(),
            searches_path: std::env::var("RSNW_SEARCHES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./searches.yaml")),
            deadline: Duration::from_secs(env_u64("RSNW_DEADLINE_SECS", 300)),
            max_per_source: env_u64("RSNW_MAX_PER_SOURCE", 5) as usize,
            source_pause: Duration::from_secs(env_u64("RSNW_SOURCE_PAUSE_SECS", 2)),
            item_pause: Duration::from_secs(env_u64("RSNW_ITEM_PAUSE_SECS", 3)),
            lenient_url_change: env_flag("RSNW_LENIENT_SUBMIT"),
            tz_offset_hours: std::env::var("RSNW_TZ_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            screenshot_dir: std::env::var("RSNW_SCREENSHOT_DIR").ok().map(PathBuf::from),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// One search task: which query to run, against which vertical, in which
/// interface language, and the category label stamped onto its candidates.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchTask {
    pub category: String,
    pub query: String,
    pub kind: SearchKind,
    pub lang: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordSets {
    #[serde(default)]
    pub brand: Vec<String>,
    #[serde(default)]
    pub product: Vec<String>,
    #[serde(default)]
    pub security: Vec<String>,
}

impl KeywordSets {
    fn filter(&self) -> RelevanceFilter {
        // The brand set is mandatory; an empty override would disable the
        // filter entirely, so fall back to the defaults instead.
        if self.brand.is_empty() {
            return RelevanceFilter::default();
        }
        RelevanceFilter::new(&self.brand, &self.product, &self.security)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchPlan {
    pub searches: Vec<SearchTask>,
    #[serde(default)]
    pub keywords: Option<KeywordSets>,
}

impl SearchPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load the plan, falling back to the built-in default plan when the
    /// file is missing or malformed; an unattended run should still do
    /// something useful.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "no search plan file, using built-in defaults");
            return Self::default_plan();
        }
        match Self::load(path) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(path = %path.display(), "unusable search plan ({err:#}), using built-in defaults");
                Self::default_plan()
            }
        }
    }

    pub fn default_plan() -> Self {
        let task = |category: &str, query: &str, kind: SearchKind, lang: &str| SearchTask {
            category: category.to_string(),
            query: query.to_string(),
            kind,
            lang: lang.to_string(),
        };
        Self {
            searches: vec![
                task("Google News (EN)", "ASUS router security", SearchKind::News, "en"),
                task("Google News (TW)", "華碩 路由器 資安", SearchKind::News, "zh-TW"),
                task("官方資源", "site:asus.com security router", SearchKind::Web, "en"),
                task(
                    "資安通報",
                    "site:bleepingcomputer.com OR site:thehackernews.com ASUS",
                    SearchKind::News,
                    "en",
                ),
            ],
            keywords: None,
        }
    }

    pub fn filter(&self) -> RelevanceFilter {
        self.keywords
            .as_ref()
            .map(KeywordSets::filter)
            .unwrap_or_default()
    }
}

/// Capture moment formatted for the form's timestamp field, in a fixed UTC
/// offset (the dataset's home timezone).
pub fn capture_timestamp(offset_hours: i32) -> String {
    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    match FixedOffset::east_opt(offset_hours * 3600) {
        Some(offset) => Utc::now().with_timezone(&offset).format(FORMAT).to_string(),
        None => Utc::now().format(FORMAT).to_string(),
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub harvested: usize,
    pub inserted: usize,
}

pub struct IngestionPipeline<'a> {
    factory: &'a dyn SessionFactory,
    store: &'a dyn NewsStore,
    harvester: SearchHarvester,
    reader: ContentReader,
    plan: SearchPlan,
    max_per_source: usize,
    source_pause: Duration,
    tz_offset_hours: i32,
}

impl<'a> IngestionPipeline<'a> {
    pub fn new(
        factory: &'a dyn SessionFactory,
        store: &'a dyn NewsStore,
        config: &WatcherConfig,
        plan: SearchPlan,
    ) -> Self {
        let mut harvester = SearchHarvester::new(plan.filter());
        if let Some(dir) = &config.screenshot_dir {
            harvester = harvester.with_screenshot_dir(dir.clone());
        }
        Self {
            factory,
            store,
            harvester,
            reader: ContentReader::default(),
            plan,
            max_per_source: config.max_per_source.max(1),
            source_pause: config.source_pause,
            tz_offset_hours: config.tz_offset_hours,
        }
    }

    pub async fn run(&self) -> Result<IngestReport> {
        let run_id = Uuid::new_v4();
        info!(%run_id, searches = self.plan.searches.len(), "ingestion starting");

        let mut session = self
            .factory
            .open()
            .await
            .map_err(anyhow::Error::from)
            .context("opening browser session")?;

        let mut candidates: Vec<CandidateRecord> = Vec::new();
        for (index, task) in self.plan.searches.iter().enumerate() {
            let harvester = &self.harvester;
            let (returned, result) = retry_once_on_session_loss(
                self.factory,
                session,
                |err: &HarvestError| err.is_session_fatal(),
                |mut s| async move {
                    let outcome = harvester
                        .harvest(s.as_mut(), &task.query, &task.category, task.kind, &task.lang)
                        .await;
                    (s, outcome)
                },
            )
            .await;
            session = returned;

            match result {
                Ok(found) => {
                    let kept = found.len().min(self.max_per_source);
                    if kept < found.len() {
                        info!(category = %task.category, kept, found = found.len(), "capping candidates for source");
                    }
                    candidates.extend(found.into_iter().take(self.max_per_source));
                }
                Err(err) => {
                    warn!(category = %task.category, "harvest failed, skipping source: {err}");
                }
            }

            if index + 1 < self.plan.searches.len() {
                sleep(self.source_pause).await;
            }
        }

        if candidates.is_empty() {
            warn!(%run_id, "no candidates harvested");
            quit_quietly(session.as_mut()).await;
            return Ok(IngestReport {
                run_id,
                harvested: 0,
                inserted: 0,
            });
        }

        info!(count = candidates.len(), "reading article bodies");
        let captured_at = capture_timestamp(self.tz_offset_hours);
        let today = Local::now().date_naive();
        let mut records = Vec::new();
        for candidate in &candidates {
            let (returned, outcome) = self
                .reader
                .read(self.factory, session, &candidate.url)
                .await;
            session = returned;
            records.push(CleanedRecord {
                title: candidate.title.trim().to_string(),
                url: candidate.url.clone(),
                publish_date: normalize_date(&candidate.date_raw, today),
                source: candidate.source.clone(),
                description: description_for(candidate, &outcome),
            });
        }
        quit_quietly(session.as_mut()).await;

        let batch = CapturedBatch {
            records,
            captured_at,
        };
        let inserted = self.store.insert(&batch.records).await?;
        info!(%run_id, harvested = candidates.len(), inserted, "ingestion finished");
        Ok(IngestReport {
            run_id,
            harvested: candidates.len(),
            inserted,
        })
    }
}

fn description_for(candidate: &CandidateRecord, outcome: &ReadOutcome) -> String {
    if let ReadOutcome::Text(text) = outcome {
        if text.chars().count() > MIN_USABLE_BODY_CHARS {
            return text.clone();
        }
    }
    match candidate.snippet.as_deref().map(str::trim) {
        Some(snippet) if !snippet.is_empty() => format!("{SNIPPET_PREFIX}{snippet}"),
        _ => NO_SUMMARY_PLACEHOLDER.to_string(),
    }
}

async fn quit_quietly(session: &mut dyn BrowserSession) {
    if let Err(err) = session.quit().await {
        warn!(error = %err, "session teardown failed");
    }
}

// ---------------------------------------------------------------------------
// Form submission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitPolicy {
    pub lenient_url_change: bool,
}

/// Drives the external form: locates fields by the documented ordering
/// contract, fills them, clicks the localized submit control and verifies
/// the acknowledgment.
pub struct FormFiller {
    form_url: String,
    policy: SubmitPolicy,
    nav_timeout: Duration,
    render_wait: Duration,
    ack_wait: Duration,
    poll_interval: Duration,
}

impl FormFiller {
    pub fn new(form_url: impl Into<String>, policy: SubmitPolicy) -> Self {
        Self {
            form_url: form_url.into(),
            policy,
            nav_timeout: Duration::from_secs(20),
            render_wait: Duration::from_secs(15),
            ack_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_waits(mut self, render_wait: Duration, ack_wait: Duration, poll_interval: Duration) -> Self {
        self.render_wait = render_wait;
        self.ack_wait = ack_wait;
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub async fn fill_and_submit(
        &self,
        session: &mut dyn BrowserSession,
        item: &NewsItem,
        captured_at: &str,
    ) -> Result<()> {
        session
            .navigate(&self.form_url, self.nav_timeout)
            .await
            .context("opening form")?;
        anyhow::ensure!(
            self.wait_for_selector(session, "div[role='listitem']").await?,
            "form never rendered"
        );

        let inputs = session.find_elements("input[type='text']").await?;
        anyhow::ensure!(
            inputs.len() >= FORM_TEXT_FIELDS,
            "form exposed {} text inputs, expected at least {FORM_TEXT_FIELDS}",
            inputs.len()
        );

        let filled = session.execute_script(&fill_script(item, captured_at)?).await?;
        anyhow::ensure!(
            filled.as_bool() == Some(true),
            "fill script could not populate the form"
        );

        let clicked = session.execute_script(SUBMIT_CLICK_JS).await?;
        anyhow::ensure!(clicked.as_bool() == Some(true), "no localized submit control found");

        if self.wait_for_ack(session).await? {
            return Ok(());
        }
        if self.policy.lenient_url_change {
            let final_url = session.current_url().await?;
            if !final_url.is_empty() && final_url != self.form_url {
                info!("no acknowledgment marker, accepting post-submit url change");
                return Ok(());
            }
        }
        anyhow::bail!("no submission acknowledgment detected")
    }

    async fn wait_for_selector(&self, session: &mut dyn BrowserSession, selector: &str) -> Result<bool> {
        let quoted = serde_json::to_string(selector)?;
        let js = format!("document.querySelector({quoted}) !== null");
        let deadline = tokio::time::Instant::now() + self.render_wait;
        loop {
            if session.execute_script(&js).await?.as_bool() == Some(true) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_ack(&self, session: &mut dyn BrowserSession) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.ack_wait;
        loop {
            let text = session.page_text().await?;
            if ACK_MARKERS.iter().any(|marker| text.contains(marker)) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.poll_interval).await;
        }
    }
}

fn fill_script(item: &NewsItem, captured_at: &str) -> Result<String> {
    let date = item.publish_date.format("%Y-%m-%d").to_string();
    let values = serde_json::to_string(&[
        item.title.as_str(),
        item.url.as_str(),
        date.as_str(),
        item.source.as_str(),
        captured_at,
    ])?;
    let description: String = if item.description.trim().is_empty() {
        NO_SUMMARY_PLACEHOLDER.to_string()
    } else {
        item.description.chars().take(DESCRIPTION_LIMIT).collect()
    };
    let description = serde_json::to_string(&description)?;
    Ok(format!(
        r#"(() => {{
  const values = {values};
  const inputs = Array.from(document.querySelectorAll('input[type="text"]'));
  if (inputs.length < values.length) {{ return false; }}
  values.forEach((value, i) => {{
    const input = inputs[i];
    input.value = value;
    input.dispatchEvent(new Event('input', {{ bubbles: true }}));
    input.dispatchEvent(new Event('change', {{ bubbles: true }}));
  }});
  const area = document.querySelector('textarea');
  if (area) {{
    area.value = {description};
    area.dispatchEvent(new Event('input', {{ bubbles: true }}));
    area.dispatchEvent(new Event('change', {{ bubbles: true }}));
  }}
  return true;
}})()"#
    ))
}

const SUBMIT_CLICK_JS: &str = r#"(() => {
  const spans = Array.from(document.querySelectorAll('span'));
  const control = spans.find(span => {
    const text = (span.textContent || '').trim();
    return text === '提交' || text === 'Submit';
  });
  if (!control) { return false; }
  control.click();
  return true;
})()"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitReport {
    pub attempted: usize,
    pub submitted: usize,
    pub failed: usize,
}

pub struct SubmissionPipeline<'a> {
    factory: &'a dyn SessionFactory,
    store: &'a dyn NewsStore,
    filler: FormFiller,
    item_pause: Duration,
    tz_offset_hours: i32,
    screenshot_dir: Option<PathBuf>,
}

impl<'a> SubmissionPipeline<'a> {
    pub fn new(
        factory: &'a dyn SessionFactory,
        store: &'a dyn NewsStore,
        config: &WatcherConfig,
    ) -> Result<Self> {
        let form_url = config
            .form_url
            .clone()
            .context("RSNW_FORM_URL is not set")?;
        let filler = FormFiller::new(
            form_url,
            SubmitPolicy {
                lenient_url_change: config.lenient_url_change,
            },
        );
        Ok(Self {
            factory,
            store,
            filler,
            item_pause: config.item_pause,
            tz_offset_hours: config.tz_offset_hours,
            screenshot_dir: config.screenshot_dir.clone(),
        })
    }

    /// Replace the form driver (tests shrink its waits).
    pub fn with_filler(mut self, filler: FormFiller) -> Self {
        self.filler = filler;
        self
    }

    pub async fn run(&self) -> Result<SubmitReport> {
        let pending = self.store.pending().await?;
        if pending.is_empty() {
            info!("no pending items");
            return Ok(SubmitReport::default());
        }

        info!(count = pending.len(), "submitting pending items");
        let mut report = SubmitReport {
            attempted: pending.len(),
            ..SubmitReport::default()
        };

        for (index, item) in pending.iter().enumerate() {
            info!(item = index + 1, total = pending.len(), id = item.id, title = %item.title, "filling form");
            match self.submit_one(item).await {
                Ok(()) => {
                    self.store.mark_submitted(item.id).await?;
                    report.submitted += 1;
                    info!(id = item.id, "submitted");
                }
                Err(err) => {
                    warn!(id = item.id, "submission failed: {err:#}");
                    let outcome = self.store.record_failure(item.id).await?;
                    if outcome.escalated {
                        warn!(id = item.id, fail_count = outcome.fail_count, "item gave up as error");
                    }
                    report.failed += 1;
                }
            }
            if index + 1 < pending.len() {
                sleep(self.item_pause).await;
            }
        }

        info!(
            submitted = report.submitted,
            failed = report.failed,
            "submission finished"
        );
        Ok(report)
    }

    /// One item, one fresh session, torn down no matter what.
    async fn submit_one(&self, item: &NewsItem) -> Result<()> {
        let mut session = self
            .factory
            .open()
            .await
            .map_err(anyhow::Error::from)
            .context("opening form session")?;

        let captured_at = capture_timestamp(self.tz_offset_hours);
        let result = self
            .filler
            .fill_and_submit(session.as_mut(), item, &captured_at)
            .await;

        if result.is_err() {
            if let Some(dir) = &self.screenshot_dir {
                let path = dir.join(format!("submit-{}.png", item.id));
                let _ = session.screenshot(&path).await;
            }
        }
        quit_quietly(session.as_mut()).await;
        result
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Killed,
}

/// Last-resort liveness guard. Arms a one-shot watchdog; if the job outlives
/// the deadline, the kill action fires: in production an immediate
/// `process::exit`, deliberately skipping cleanup, because the only realistic
/// cause is a browser session that ignores normal cancellation.
pub struct JobSupervisor {
    deadline: Duration,
    kill: Arc<dyn Fn() + Send + Sync>,
}

impl JobSupervisor {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            kill: Arc::new(|| {
                error!(code = KILL_EXIT_CODE, "deadline exceeded, forcing process exit");
                std::process::exit(KILL_EXIT_CODE);
            }),
        }
    }

    /// Substitute the kill action (tests record instead of exiting).
    pub fn with_kill_action(mut self, kill: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.kill = kill;
        self
    }

    pub async fn run<T>(&self, job: impl std::future::Future<Output = T>) -> (T, RunState) {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let kill = Arc::clone(&self.kill);
        let deadline = self.deadline;

        info!(deadline_secs = deadline.as_secs(), "supervisor armed");
        let watchdog = tokio::spawn(async move {
            sleep(deadline).await;
            flag.store(true, Ordering::SeqCst);
            warn!("watchdog deadline exceeded, invoking kill action");
            kill();
        });

        let output = job.await;

        // Disarm before exit; a normal completion must never be followed by
        // a late kill.
        watchdog.abort();
        let state = if fired.load(Ordering::SeqCst) {
            RunState::Killed
        } else {
            RunState::Completed
        };
        info!(?state, "supervisor finished");
        (output, state)
    }
}

// ---------------------------------------------------------------------------
// Whole-run entrypoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub state: RunState,
    pub ingest: Option<IngestReport>,
    pub submit: Option<SubmitReport>,
}

pub async fn run_ingest(
    config: &WatcherConfig,
    factory: &dyn SessionFactory,
    store: &dyn NewsStore,
) -> Result<IngestReport> {
    let plan = SearchPlan::load_or_default(&config.searches_path);
    IngestionPipeline::new(factory, store, config, plan).run().await
}

pub async fn run_submit(
    config: &WatcherConfig,
    factory: &dyn SessionFactory,
    store: &dyn NewsStore,
) -> Result<SubmitReport> {
    SubmissionPipeline::new(factory, store, config)?.run().await
}

/// Ingestion then submission under the deadline supervisor. A failed phase
/// is logged and the other phase still runs; the external scheduler owns
/// any process-level retry.
pub async fn run_supervised(
    config: &WatcherConfig,
    factory: &dyn SessionFactory,
    store: &dyn NewsStore,
) -> RunSummary {
    let supervisor = JobSupervisor::new(config.deadline);
    let ((ingest, submit), state) = supervisor
        .run(async {
            let ingest = match run_ingest(config, factory, store).await {
                Ok(report) => Some(report),
                Err(err) => {
                    error!("ingestion phase failed: {err:#}");
                    None
                }
            };
            let submit = match run_submit(config, factory, store).await {
                Ok(report) => Some(report),
                Err(err) => {
                    error!("submission phase failed: {err:#}");
                    None
                }
            };
            (ingest, submit)
        })
        .await;

    RunSummary {
        state,
        ingest,
        submit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rsnw_core::ItemStatus;

    fn item(description: &str) -> NewsItem {
        NewsItem {
            id: 7,
            title: "ASUS \"router\" advisory".to_string(),
            url: "https://example.com/a".to_string(),
            publish_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            source: "Google News (EN)".to_string(),
            description: description.to_string(),
            status: ItemStatus::New,
            fail_count: 0,
        }
    }

    #[test]
    fn default_plan_covers_both_languages_and_verticals() {
        let plan = SearchPlan::default_plan();
        assert_eq!(plan.searches.len(), 4);
        assert!(plan.searches.iter().any(|t| t.lang == "zh-TW"));
        assert!(plan.searches.iter().any(|t| t.kind == SearchKind::Web));
    }

    #[test]
    fn search_plan_parses_yaml_with_keyword_overrides() {
        let yaml = r#"
searches:
  - category: "News"
    query: "ASUS router security"
    kind: news
    lang: en
keywords:
  brand: ["asus"]
  product: ["router"]
  security: ["cve"]
"#;
        let plan: SearchPlan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(plan.searches.len(), 1);
        assert_eq!(plan.searches[0].kind, SearchKind::News);
        let filter = plan.filter();
        assert!(filter.is_relevant("ASUS router update", ""));
        assert!(!filter.is_relevant("ASUS monitor review", ""));
    }

    #[test]
    fn empty_brand_override_keeps_the_default_filter() {
        let sets = KeywordSets {
            brand: vec![],
            product: vec!["router".into()],
            security: vec![],
        };
        assert!(sets.filter().is_relevant("ASUS router security update", ""));
    }

    #[test]
    fn description_prefers_usable_body_text() {
        let candidate = CandidateRecord {
            title: "t".into(),
            url: "u".into(),
            date_raw: "Today".into(),
            source: "s".into(),
            snippet: Some("snippet text".into()),
        };
        let long_body = "b".repeat(40);
        assert_eq!(
            description_for(&candidate, &ReadOutcome::Text(long_body.clone())),
            long_body
        );
        // Short bodies fall back to the snippet, with the fallback marker.
        assert_eq!(
            description_for(&candidate, &ReadOutcome::Text("short".into())),
            format!("{SNIPPET_PREFIX}snippet text")
        );
        assert_eq!(
            description_for(
                &candidate,
                &ReadOutcome::Skip(rsnw_harvest::SkipSignal::NotFound)
            ),
            format!("{SNIPPET_PREFIX}snippet text")
        );
        let bare = CandidateRecord {
            snippet: None,
            ..candidate
        };
        assert_eq!(
            description_for(&bare, &ReadOutcome::Skip(rsnw_harvest::SkipSignal::Unreadable)),
            NO_SUMMARY_PLACEHOLDER
        );
    }

    #[test]
    fn capture_timestamp_has_the_expected_shape() {
        let stamp = capture_timestamp(8);
        assert_eq!(stamp.len(), 19);
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[13..14], ":");
        // Out-of-range offsets degrade to UTC instead of panicking.
        let utc_stamp = capture_timestamp(99);
        assert_eq!(utc_stamp.len(), 19);
    }

    #[test]
    fn fill_script_escapes_values() {
        let script = fill_script(&item("desc"), "2024-06-10 12:00:00").unwrap();
        assert!(script.contains(r#"ASUS \"router\" advisory"#));
        assert!(script.contains("2024-06-10 12:00:00"));
        assert!(script.contains("textarea"));
    }

    #[test]
    fn fill_script_truncates_and_substitutes_empty_descriptions() {
        let long = item(&"x".repeat(600));
        let script = fill_script(&long, "now").unwrap();
        assert!(!script.contains(&"x".repeat(501)));
        assert!(script.contains(&"x".repeat(500)));

        let empty = item("   ");
        let script = fill_script(&empty, "now").unwrap();
        assert!(script.contains(NO_SUMMARY_PLACEHOLDER));
    }

    #[tokio::test]
    async fn supervisor_kills_past_deadline() {
        let killed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&killed);
        let supervisor = JobSupervisor::new(Duration::from_millis(20))
            .with_kill_action(Arc::new(move || flag.store(true, Ordering::SeqCst)));

        let ((), state) = supervisor
            .run(async {
                sleep(Duration::from_millis(120)).await;
            })
            .await;

        assert_eq!(state, RunState::Killed);
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn supervisor_disarms_on_normal_completion() {
        let killed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&killed);
        let supervisor = JobSupervisor::new(Duration::from_millis(50))
            .with_kill_action(Arc::new(move || flag.store(true, Ordering::SeqCst)));

        let (value, state) = supervisor.run(async { 41 + 1 }).await;
        assert_eq!(value, 42);
        assert_eq!(state, RunState::Completed);

        // The aborted watchdog must never fire late.
        sleep(Duration::from_millis(120)).await;
        assert!(!killed.load(Ordering::SeqCst));
    }
}
