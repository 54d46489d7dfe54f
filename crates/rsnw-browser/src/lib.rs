//! Browsing collaborator boundary: a capability trait over a headless
//! browser session, the chromium-backed implementation, and a bounded
//! restart-once retry combinator for session-fatal failures.
//!
//! The rest of the workspace only ever talks to [`BrowserSession`] /
//! [`SessionFactory`]; selector strings and page scripts stay in the
//! harvesting and submission crates.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "rsnw-browser";

pub mod testing;

/// Chromium hardening flags for unattended container use.
const HARDENING_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-blink-features=AutomationControlled",
];

/// Search surfaces serve degraded markup to obvious automation agents.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

const WEBDRIVER_MASK_JS: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined })";

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation to {url} timed out after {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("browser session lost: {0}")]
    SessionLost(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("screenshot failed: {0}")]
    Screenshot(String),
    #[error(transparent)]
    Driver(#[from] chromiumoxide::error::CdpError),
}

impl BrowserError {
    /// True for errors meaning the session itself is unusable (dead child
    /// process, broken devtools channel) rather than a per-page failure.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            BrowserError::Launch(_) | BrowserError::SessionLost(_) => true,
            BrowserError::Driver(err) => {
                let message = err.to_string().to_lowercase();
                message.contains("connection")
                    || message.contains("channel")
                    || message.contains("closed")
                    || message.contains("websocket")
                    || message.contains("invalid session")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;

/// Capability set the core pipelines invoke against a live browser page.
/// One session owns exactly one page; sessions are never shared between
/// pipeline stages.
#[async_trait]
pub trait BrowserSession: Send {
    /// Navigate to `url`, bounded by `timeout`. A timeout is reported as
    /// [`BrowserError::NavigationTimeout`]; callers decide whether partial
    /// content is acceptable.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Evaluate a script in the page, returning its JSON value
    /// (`null` when the script yields nothing).
    async fn execute_script(&mut self, js: &str) -> Result<serde_json::Value>;

    /// Outer HTML of every element matching a CSS selector.
    async fn find_elements(&mut self, selector: &str) -> Result<Vec<String>>;

    async fn current_url(&mut self) -> Result<String>;

    async fn title(&mut self) -> Result<String>;

    /// Full serialized page HTML.
    async fn content(&mut self) -> Result<String>;

    /// Rendered body text.
    async fn page_text(&mut self) -> Result<String>;

    async fn screenshot(&mut self, path: &Path) -> Result<()>;

    /// Tear the session down. Idempotent.
    async fn quit(&mut self) -> Result<()>;
}

/// Opens fresh sessions; the restart combinator and the submission pipeline
/// both go through this.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>>;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub user_agent: String,
    pub window_size: (u32, u32),
    pub extra_args: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window_size: (1920, 1080),
            extra_args: Vec::new(),
        }
    }
}

/// Headless-chromium session. The devtools event handler runs on its own
/// task for the lifetime of the session.
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler_task: tokio::task::JoinHandle<()>,
    closed: bool,
}

impl ChromiumSession {
    pub async fn launch(config: &DriverConfig) -> Result<Self> {
        let mut builder = BrowserConfig::builder().window_size(config.window_size.0, config.window_size.1);
        for arg in HARDENING_ARGS {
            builder = builder.arg(*arg);
        }
        builder = builder.arg(format!("--user-agent={}", config.user_agent));
        for arg in &config.extra_args {
            builder = builder.arg(arg);
        }
        let browser_config = builder.build().map_err(BrowserError::Launch)?;

        debug!("launching headless chromium");
        let (browser, mut handler) = Browser::launch(browser_config).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        // Mask is best-effort; a blocked evaluation must not fail the launch.
        let _ = page.evaluate(WEBDRIVER_MASK_JS).await;

        info!("browser session ready");
        Ok(Self {
            browser,
            page,
            handler_task,
            closed: false,
        })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(BrowserError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            }),
        }
    }

    async fn execute_script(&mut self, js: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(js).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<String>> {
        let quoted =
            serde_json::to_string(selector).map_err(|err| BrowserError::Script(err.to_string()))?;
        let js = format!("Array.from(document.querySelectorAll({quoted})).map(el => el.outerHTML)");
        let value = self.execute_script(&js).await?;
        serde_json::from_value(value).map_err(|err| BrowserError::Script(err.to_string()))
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn title(&mut self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn page_text(&mut self) -> Result<String> {
        let value = self
            .execute_script("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&mut self, path: &Path) -> Result<()> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .save_screenshot(params, path)
            .await
            .map_err(|err| BrowserError::Screenshot(err.to_string()))?;
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "browser close failed, abandoning process");
        }
        self.handler_task.abort();
        debug!("browser session torn down");
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChromiumFactory {
    config: DriverConfig,
}

impl ChromiumFactory {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ChromiumFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        Ok(Box::new(ChromiumSession::launch(&self.config).await?))
    }
}

/// Run `op` against a session; if it fails with a session-fatal error
/// (as judged by `is_session_fatal`), discard the session, open a fresh one
/// from `factory` and retry exactly once. Any second failure propagates.
///
/// The operation takes ownership of the session and hands it back so the
/// combinator can swap in the replacement.
pub async fn retry_once_on_session_loss<T, E, Op, Fut>(
    factory: &dyn SessionFactory,
    session: Box<dyn BrowserSession>,
    is_session_fatal: impl Fn(&E) -> bool,
    mut op: Op,
) -> (Box<dyn BrowserSession>, std::result::Result<T, E>)
where
    E: From<BrowserError> + std::fmt::Display,
    Op: FnMut(Box<dyn BrowserSession>) -> Fut,
    Fut: Future<Output = (Box<dyn BrowserSession>, std::result::Result<T, E>)>,
{
    let (mut session, first) = op(session).await;
    match first {
        Err(err) if is_session_fatal(&err) => {
            warn!(error = %err, "session-fatal error, restarting browser session once");
            if let Err(quit_err) = session.quit().await {
                debug!(error = %quit_err, "discarding dead session");
            }
            match factory.open().await {
                Ok(fresh) => op(fresh).await,
                Err(open_err) => (session, Err(E::from(open_err))),
            }
        }
        other => (session, other),
    }
}
