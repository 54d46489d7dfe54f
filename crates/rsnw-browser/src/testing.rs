//! Scripted in-memory sessions for deterministic tests: no network, no
//! browser process. Downstream crates drive their pipelines against these.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{BrowserError, BrowserSession, Result, SessionFactory};

/// Shared recorder for everything the sessions of one test did.
#[derive(Clone, Default)]
pub struct SessionLog(Arc<Mutex<LogInner>>);

#[derive(Default)]
struct LogInner {
    opens: usize,
    quits: usize,
    navigations: Vec<String>,
    scripts: Vec<String>,
    screenshots: Vec<PathBuf>,
}

impl SessionLog {
    pub fn opens(&self) -> usize {
        self.0.lock().unwrap().opens
    }

    pub fn quits(&self) -> usize {
        self.0.lock().unwrap().quits
    }

    pub fn navigations(&self) -> Vec<String> {
        self.0.lock().unwrap().navigations.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.0.lock().unwrap().scripts.clone()
    }

    pub fn screenshots(&self) -> Vec<PathBuf> {
        self.0.lock().unwrap().screenshots.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.0.lock().unwrap()
    }
}

/// Canned page state plus optional failure injection.
pub struct StaticSession {
    log: SessionLog,
    page_title: String,
    page_html: String,
    page_text: String,
    current_url: String,
    /// Values returned by successive `current_url` calls before settling on
    /// the last one.
    url_sequence: VecDeque<String>,
    /// Values returned by successive `execute_script` calls; `null` once
    /// drained.
    script_results: VecDeque<serde_json::Value>,
    /// selector -> outer-HTML matches returned by `find_elements`.
    elements: Vec<(String, Vec<String>)>,
    /// Number of leading `navigate` calls that fail session-fatally.
    failing_navigations: usize,
}

impl StaticSession {
    pub fn new(log: SessionLog) -> Self {
        Self {
            log,
            page_title: String::new(),
            page_html: String::new(),
            page_text: String::new(),
            current_url: String::new(),
            url_sequence: VecDeque::new(),
            script_results: VecDeque::new(),
            elements: Vec::new(),
            failing_navigations: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.page_title = title.into();
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.page_html = html.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.page_text = text.into();
        self
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.url_sequence = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_script_results<I>(mut self, results: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        self.script_results = results.into_iter().collect();
        self
    }

    pub fn with_elements(mut self, selector: impl Into<String>, matches: Vec<String>) -> Self {
        self.elements.push((selector.into(), matches));
        self
    }

    pub fn failing_navigations(mut self, count: usize) -> Self {
        self.failing_navigations = count;
        self
    }
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        if self.failing_navigations > 0 {
            self.failing_navigations -= 1;
            return Err(BrowserError::SessionLost("scripted navigation failure".into()));
        }
        self.log.lock().navigations.push(url.to_string());
        self.current_url = url.to_string();
        Ok(())
    }

    async fn execute_script(&mut self, js: &str) -> Result<serde_json::Value> {
        self.log.lock().scripts.push(js.to_string());
        Ok(self.script_results.pop_front().unwrap_or(serde_json::Value::Null))
    }

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<String>> {
        Ok(self
            .elements
            .iter()
            .find(|(sel, _)| sel == selector)
            .map(|(_, matches)| matches.clone())
            .unwrap_or_default())
    }

    async fn current_url(&mut self) -> Result<String> {
        if let Some(url) = self.url_sequence.pop_front() {
            self.current_url = url;
        }
        Ok(self.current_url.clone())
    }

    async fn title(&mut self) -> Result<String> {
        Ok(self.page_title.clone())
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.page_html.clone())
    }

    async fn page_text(&mut self) -> Result<String> {
        Ok(self.page_text.clone())
    }

    async fn screenshot(&mut self, path: &Path) -> Result<()> {
        self.log.lock().screenshots.push(path.to_path_buf());
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        self.log.lock().quits += 1;
        Ok(())
    }
}

/// Hands out queued sessions in order; once drained, opens blank sessions so
/// restart paths always succeed unless a test says otherwise.
pub struct StaticFactory {
    log: SessionLog,
    sessions: Mutex<VecDeque<StaticSession>>,
    fail_opens: Mutex<usize>,
}

impl StaticFactory {
    pub fn new(log: SessionLog) -> Self {
        Self {
            log,
            sessions: Mutex::new(VecDeque::new()),
            fail_opens: Mutex::new(0),
        }
    }

    pub fn push(&self, session: StaticSession) {
        self.sessions.lock().unwrap().push_back(session);
    }

    /// Make the next `count` `open` calls fail.
    pub fn fail_next_opens(&self, count: usize) {
        *self.fail_opens.lock().unwrap() = count;
    }
}

#[async_trait]
impl SessionFactory for StaticFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        {
            let mut failures = self.fail_opens.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BrowserError::Launch("scripted launch failure".into()));
            }
        }
        self.log.lock().opens += 1;
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StaticSession::new(self.log.clone()));
        Ok(Box::new(session))
    }
}
