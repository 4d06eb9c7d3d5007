//! Browser-session lifecycle, recovery policy, and listing/detail extraction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "marginwatch-browser";

/// Fixed capability profile every session is constructed with.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub headless: bool,
    pub load_images: bool,
    pub load_plugins: bool,
    pub page_load_timeout: Duration,
    pub implicit_wait: Duration,
    pub user_agent: Option<String>,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            headless: true,
            load_images: false,
            load_plugins: false,
            page_load_timeout: Duration::from_secs(20),
            implicit_wait: Duration::from_secs(5),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser session: {0}")]
    Launch(String),
    #[error("browser session is gone: {0}")]
    SessionGone(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("timed out loading {url}")]
    Timeout { url: String },
    #[error("no element matched {selector}")]
    ElementNotFound { selector: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDisposition {
    Recoverable,
    SessionLost,
}

pub fn classify_browser_error(err: &BrowserError) -> SessionDisposition {
    match err {
        BrowserError::Launch(_) | BrowserError::SessionGone(_) => SessionDisposition::SessionLost,
        _ => SessionDisposition::Recoverable,
    }
}

/// Page-level error signatures that mean the remote session is not coming back.
pub fn looks_like_dead_session(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("session") || lower.contains("disconnect")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// A live handle to the remote browser. Implementations must keep the
/// primary browsing context intact across `fetch_detail`: the detail page is
/// opened in a secondary context that is released on every exit path.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Cheap liveness probe; never errors.
    async fn is_alive(&self) -> bool;
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;
    async fn page_source(&self) -> Result<String, BrowserError>;
    /// Fetch a detail page in a secondary context, bounded by `timeout`.
    async fn fetch_detail(&self, url: &str, timeout: Duration) -> Result<String, BrowserError>;
    /// Try to activate the first element matching `selector`.
    /// Ok(false) when nothing matched or nothing could be followed.
    async fn click(&self, selector: &str) -> Result<bool, BrowserError>;
    async fn close(&self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

#[derive(Debug, Error)]
#[error("browser session could not be reacquired: {0}")]
pub struct SessionFatal(pub String);

/// Owns the lifecycle of the single remote-browser session. Every other
/// component reaches the browser through `ensure_usable`.
pub struct SessionManager {
    factory: Box<dyn SessionFactory>,
    profile: SessionProfile,
    backoff: BackoffPolicy,
    session: Option<Box<dyn BrowserSession>>,
}

impl SessionManager {
    pub fn new(factory: Box<dyn SessionFactory>, profile: SessionProfile) -> Self {
        Self {
            factory,
            profile,
            backoff: BackoffPolicy::default(),
            session: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Check the current session with a trivial probe; if it is dead, tear it
    /// down and construct a fresh one, optionally replaying navigation to
    /// `reload_url` and waiting for a minimal readiness signal. Exhausting
    /// the relaunch budget is fatal for the run.
    pub async fn ensure_usable(
        &mut self,
        reload_url: Option<&str>,
    ) -> Result<&dyn BrowserSession, SessionFatal> {
        let alive = match &self.session {
            Some(session) => session.is_alive().await,
            None => false,
        };

        if !alive {
            self.invalidate().await;
            self.relaunch(reload_url).await?;
        }

        Ok(self
            .session
            .as_deref()
            .expect("session present after successful relaunch"))
    }

    pub async fn invalidate(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    async fn relaunch(&mut self, reload_url: Option<&str>) -> Result<(), SessionFatal> {
        let mut last_error = String::from("no launch attempted");

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }

            let session = match self.factory.launch(&self.profile).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(attempt, error = %err, "browser launch failed");
                    last_error = err.to_string();
                    continue;
                }
            };

            if let Some(url) = reload_url {
                if let Err(err) = session.navigate(url).await {
                    warn!(attempt, url, error = %err, "replay navigation failed");
                    last_error = err.to_string();
                    session.close().await;
                    continue;
                }
                let ready = session
                    .page_source()
                    .await
                    .map(|source| !source.trim().is_empty())
                    .unwrap_or(false);
                if !ready {
                    warn!(attempt, url, "page not ready after replay navigation");
                    last_error = format!("empty page after navigating to {url}");
                    session.close().await;
                    continue;
                }
            }

            self.session = Some(session);
            return Ok(());
        }

        Err(SessionFatal(last_error))
    }
}

/// One notice row as it appears on the listing page. `context_text` is the
/// row's full visible text, handed to the relevance classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub title: String,
    pub date_text: String,
    pub href: String,
    pub context_text: String,
}

const ROW_SELECTORS: [&str; 5] = [
    ".table_item_info",
    ".notice_item",
    ".list_item",
    "[class*='item_info']",
    "[class*='notice']",
];

/// Next-page controls probed in order; the listing UI has shipped several.
pub const NEXT_PAGE_SELECTORS: [&str; 3] = [
    ".btn-next:not([disabled])",
    ".el-pagination__next:not(.is-disabled)",
    ".pagination-next:not(.disabled)",
];

/// Extract notice rows from a listing page, trying row selectors in order.
pub fn parse_listing_rows(html: &str) -> Vec<ListingRow> {
    let document = Html::parse_document(html);
    for selector in ROW_SELECTORS {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        let rows: Vec<ListingRow> = document.select(&sel).filter_map(row_from_element).collect();
        if !rows.is_empty() {
            return rows;
        }
    }
    Vec::new()
}

fn row_from_element(element: ElementRef<'_>) -> Option<ListingRow> {
    let title_sel = Selector::parse(".info_item_title a").expect("valid selector");
    let any_anchor = Selector::parse("a").expect("valid selector");
    let anchor = element
        .select(&title_sel)
        .next()
        .or_else(|| element.select(&any_anchor).next())?;

    let title = anchor
        .value()
        .attr("title")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| anchor.text().collect::<String>().trim().to_string());
    let href = anchor.value().attr("href")?.trim().to_string();
    if href.is_empty() {
        return None;
    }

    let date_sel = Selector::parse(".info_item_date").expect("valid selector");
    let date_text = element
        .select(&date_sel)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
        .or_else(|| {
            let row_text = element.text().collect::<String>();
            first_date_like(&row_text)
        })
        .unwrap_or_default();

    let context_text = element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    Some(ListingRow {
        title,
        date_text,
        href,
        context_text,
    })
}

fn first_date_like(text: &str) -> Option<String> {
    let re = Regex::new(r"\d{4}[-/]\d{1,2}[-/]\d{1,2}").expect("valid date pattern");
    re.find(text).map(|m| m.as_str().to_string())
}

/// Parse a listing date, tolerating `-`/`/` separators and surrounding text.
pub fn parse_notice_date(text: &str) -> Option<NaiveDate> {
    let re = Regex::new(r"(\d{4})[-/](\d{1,2})[-/](\d{1,2})").expect("valid date pattern");
    let caps = re.captures(text.trim())?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Resolve a listing-relative href against the listing URL.
pub fn resolve_detail_url(listing_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match Url::parse(listing_url) {
        Ok(base) => base
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string()),
        Err(_) => href.to_string(),
    }
}

/// Strip script/style blocks and markup, collapse whitespace.
pub fn clean_text(html: &str) -> String {
    let scripts = Regex::new(r"(?is)<script.*?</script>").expect("valid pattern");
    let styles = Regex::new(r"(?is)<style.*?</style>").expect("valid pattern");
    let tags = Regex::new(r"<[^>]+>").expect("valid pattern");

    let text = scripts.replace_all(html, " ");
    let text = styles.replace_all(&text, " ");
    let text = tags.replace_all(&text, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct DetailFetchConfig {
    pub min_raw_bytes: usize,
    pub min_clean_chars: usize,
    pub readiness_timeout: Duration,
}

impl Default for DetailFetchConfig {
    fn default() -> Self {
        Self {
            min_raw_bytes: 1000,
            min_clean_chars: 100,
            readiness_timeout: Duration::from_secs(10),
        }
    }
}

/// Expected, frequent, non-fatal reasons a detail page yields nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    RawTooSmall { bytes: usize },
    CleanTooShort { chars: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::RawTooSmall { bytes } => write!(f, "raw content too small ({bytes} bytes)"),
            SkipReason::CleanTooShort { chars } => {
                write!(f, "cleaned text too short ({chars} chars)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailContent {
    Text(String),
    Skipped(SkipReason),
}

/// Fetch and sanitize a detail page. Too-thin content is a `Skipped` value,
/// not an error.
pub async fn fetch_detail_text(
    session: &dyn BrowserSession,
    url: &str,
    config: &DetailFetchConfig,
) -> Result<DetailContent, BrowserError> {
    let raw = session.fetch_detail(url, config.readiness_timeout).await?;
    if raw.len() < config.min_raw_bytes {
        return Ok(DetailContent::Skipped(SkipReason::RawTooSmall {
            bytes: raw.len(),
        }));
    }
    let clean = clean_text(&raw);
    let chars = clean.chars().count();
    if chars < config.min_clean_chars {
        return Ok(DetailContent::Skipped(SkipReason::CleanTooShort { chars }));
    }
    Ok(DetailContent::Text(clean))
}

#[derive(Debug)]
struct HttpPageState {
    current_url: String,
    current_html: String,
}

/// Reference driver over plain HTTP. Listing "clicks" follow anchor hrefs,
/// which covers static pagination; a WebDriver/CDP driver slots in behind
/// the same trait for script-driven boards.
pub struct HttpSession {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    state: tokio::sync::Mutex<HttpPageState>,
    alive: AtomicBool,
}

impl HttpSession {
    async fn get_with_retries(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<(String, String), BrowserError> {
        let mut last_reason = String::from("no request attempted");

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }

            let mut request = self.client.get(url);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await.map_err(|err| BrowserError::Navigation {
                            url: url.to_string(),
                            reason: format!("reading body: {err}"),
                        })?;
                        return Ok((final_url, body));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_reason = format!("http status {status}");
                        continue;
                    }
                    return Err(BrowserError::Navigation {
                        url: url.to_string(),
                        reason: format!("http status {status}"),
                    });
                }
                Err(err) => {
                    if err.is_timeout() {
                        if attempt < self.backoff.max_retries {
                            last_reason = "timeout".to_string();
                            continue;
                        }
                        return Err(BrowserError::Timeout {
                            url: url.to_string(),
                        });
                    }
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_reason = err.to_string();
                        continue;
                    }
                    return Err(BrowserError::Navigation {
                        url: url.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Err(BrowserError::Navigation {
            url: url.to_string(),
            reason: last_reason,
        })
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BrowserError::SessionGone("session closed".to_string()));
        }
        let (final_url, body) = self.get_with_retries(url, None).await?;
        let mut state = self.state.lock().await;
        state.current_url = final_url;
        state.current_html = body;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.state.lock().await.current_url.clone())
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        Ok(self.state.lock().await.current_html.clone())
    }

    async fn fetch_detail(&self, url: &str, timeout: Duration) -> Result<String, BrowserError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BrowserError::SessionGone("session closed".to_string()));
        }
        // Secondary context: the primary page state is never touched here.
        let (_, body) = self.get_with_retries(url, Some(timeout)).await?;
        Ok(body)
    }

    async fn click(&self, selector: &str) -> Result<bool, BrowserError> {
        let target = {
            let state = self.state.lock().await;
            let document = Html::parse_document(&state.current_html);
            let Ok(sel) = Selector::parse(selector) else {
                return Err(BrowserError::ElementNotFound {
                    selector: selector.to_string(),
                });
            };
            match document.select(&sel).next() {
                Some(element) => match element.value().attr("href") {
                    Some(href) if !href.trim().is_empty() => {
                        Some(resolve_detail_url(&state.current_url, href.trim()))
                    }
                    _ => {
                        debug!(selector, "matched element has no followable href");
                        None
                    }
                },
                None => None,
            }
        };

        match target {
            Some(url) => {
                self.navigate(&url).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpSessionFactory {
    pub backoff: BackoffPolicy,
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(profile.page_load_timeout);
        if let Some(user_agent) = &profile.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        Ok(Box::new(HttpSession {
            client,
            backoff: self.backoff,
            state: tokio::sync::Mutex::new(HttpPageState {
                current_url: String::new(),
                current_html: String::new(),
            }),
            alive: AtomicBool::new(true),
        }))
    }
}

pub mod testing {
    //! Scripted in-memory drivers for exercising the traversal policy.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{BrowserError, BrowserSession, SessionFactory, SessionProfile};

    /// Serves a fixed sequence of listing pages and a map of detail bodies.
    /// `navigate` loads the first listing, each successful `click` advances
    /// to the next, and an exhausted sequence reports no next control.
    pub struct ScriptedSession {
        listings: Mutex<VecDeque<String>>,
        current: Mutex<String>,
        details: Mutex<HashMap<String, String>>,
        alive: AtomicBool,
        pages_served: AtomicUsize,
        die_after_pages: Option<usize>,
    }

    impl ScriptedSession {
        pub fn new(listings: Vec<String>) -> Self {
            Self {
                listings: Mutex::new(listings.into()),
                current: Mutex::new(String::new()),
                details: Mutex::new(HashMap::new()),
                alive: AtomicBool::new(true),
                pages_served: AtomicUsize::new(0),
                die_after_pages: None,
            }
        }

        pub fn with_detail(self, url: impl Into<String>, body: impl Into<String>) -> Self {
            self.details.lock().unwrap().insert(url.into(), body.into());
            self
        }

        /// Session dies after serving this many listing pages.
        pub fn with_death_after_pages(mut self, pages: usize) -> Self {
            self.die_after_pages = Some(pages);
            self
        }

        pub fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        fn serve_next_listing(&self) -> bool {
            let mut listings = self.listings.lock().unwrap();
            match listings.pop_front() {
                Some(page) => {
                    *self.current.lock().unwrap() = page;
                    let served = self.pages_served.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(limit) = self.die_after_pages {
                        if served >= limit {
                            self.alive.store(false, Ordering::SeqCst);
                        }
                    }
                    true
                }
                None => false,
            }
        }
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(BrowserError::SessionGone("scripted death".to_string()));
            }
            if !self.serve_next_listing() {
                return Err(BrowserError::Navigation {
                    url: url.to_string(),
                    reason: "no scripted listing left".to_string(),
                });
            }
            Ok(())
        }

        async fn current_url(&self) -> Result<String, BrowserError> {
            Ok("scripted://listing".to_string())
        }

        async fn page_source(&self) -> Result<String, BrowserError> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(BrowserError::SessionGone("scripted death".to_string()));
            }
            Ok(self.current.lock().unwrap().clone())
        }

        async fn fetch_detail(&self, url: &str, _timeout: Duration) -> Result<String, BrowserError> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(BrowserError::SessionGone("scripted death".to_string()));
            }
            self.details
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| BrowserError::Navigation {
                    url: url.to_string(),
                    reason: "no scripted detail body".to_string(),
                })
        }

        async fn click(&self, _selector: &str) -> Result<bool, BrowserError> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(BrowserError::SessionGone("scripted death".to_string()));
            }
            if self.listings.lock().unwrap().is_empty() {
                return Ok(false);
            }
            Ok(self.serve_next_listing())
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Hands out pre-built sessions in order; errors once exhausted.
    #[derive(Default)]
    pub struct ScriptedFactory {
        sessions: Mutex<VecDeque<ScriptedSession>>,
        pub launches: AtomicUsize,
    }

    impl ScriptedFactory {
        pub fn single(session: ScriptedSession) -> Self {
            Self::with_sessions(vec![session])
        }

        pub fn with_sessions(sessions: Vec<ScriptedSession>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                launches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn launch(
            &self,
            _profile: &SessionProfile,
        ) -> Result<Box<dyn BrowserSession>, BrowserError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front() {
                Some(session) => Ok(Box::new(session)),
                None => Err(BrowserError::Launch("no scripted session left".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedFactory, ScriptedSession};
    use super::*;

    const LISTING_HTML: &str = r#"
        <html><body>
          <div class="table_item_info">
            <div class="info_item_title"><a title="Notice on Adjusting the Margin Ratio" href="./n1.html">Notice…</a></div>
            <div class="info_item_date">2025-04-25</div>
          </div>
          <div class="table_item_info">
            <div class="info_item_title"><a href="/notice/n2.html">Notice on Approving Brand Registration</a></div>
            <div class="info_item_date">2025-04-24</div>
          </div>
        </body></html>
    "#;

    #[test]
    fn listing_rows_prefer_title_attribute_and_keep_date_text() {
        let rows = parse_listing_rows(LISTING_HTML);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].title, "Notice on Adjusting the Margin Ratio");
        assert_eq!(rows[0].date_text, "2025-04-25");
        assert_eq!(rows[0].href, "./n1.html");
        assert_eq!(rows[1].title, "Notice on Approving Brand Registration");
    }

    #[test]
    fn listing_rows_fall_back_to_date_patterns_in_row_text() {
        let html = r#"<div class="notice_item"><a href="/n3">Some Notice</a> published 2025/3/11</div>"#;
        let rows = parse_listing_rows(html);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date_text, "2025/3/11");
    }

    #[test]
    fn notice_dates_tolerate_separators_and_noise() {
        assert_eq!(
            parse_notice_date("2025-04-25"),
            NaiveDate::from_ymd_opt(2025, 4, 25)
        );
        assert_eq!(
            parse_notice_date("published 2025/3/9 morning"),
            NaiveDate::from_ymd_opt(2025, 3, 9)
        );
        assert_eq!(parse_notice_date("no date here"), None);
    }

    #[test]
    fn detail_urls_resolve_relative_and_absolute_hrefs() {
        let listing = "https://exchange.example/publicnotice/notice/";
        assert_eq!(
            resolve_detail_url(listing, "./n1.html"),
            "https://exchange.example/publicnotice/notice/n1.html"
        );
        assert_eq!(
            resolve_detail_url(listing, "/notice/n2.html"),
            "https://exchange.example/notice/n2.html"
        );
        assert_eq!(
            resolve_detail_url(listing, "https://elsewhere.example/x"),
            "https://elsewhere.example/x"
        );
    }

    #[test]
    fn clean_text_strips_scripts_styles_and_tags() {
        let html = "<html><script>var x = 1;</script><style>.a{}</style><body><p>Margin  ratio\nadjusted</p></body></html>";
        assert_eq!(clean_text(html), "Margin ratio adjusted");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification_matches_status_families() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn dead_session_signatures_are_recognized() {
        assert!(looks_like_dead_session("invalid session id"));
        assert!(looks_like_dead_session("browser Disconnected unexpectedly"));
        assert!(!looks_like_dead_session("http status 404"));
    }

    #[tokio::test]
    async fn detail_fetch_skips_thin_and_markup_only_pages() {
        let session = ScriptedSession::new(vec![LISTING_HTML.to_string()])
            .with_detail("https://e/thin", "tiny")
            .with_detail(
                "https://e/markup",
                format!("<script>{}</script><p>hi</p>", "x".repeat(2000)),
            )
            .with_detail(
                "https://e/good",
                format!("<body><p>{}</p></body>", "real notice text ".repeat(200)),
            );
        let config = DetailFetchConfig::default();

        match fetch_detail_text(&session, "https://e/thin", &config).await.unwrap() {
            DetailContent::Skipped(SkipReason::RawTooSmall { bytes }) => assert_eq!(bytes, 4),
            other => panic!("expected raw-size skip, got {other:?}"),
        }
        match fetch_detail_text(&session, "https://e/markup", &config).await.unwrap() {
            DetailContent::Skipped(SkipReason::CleanTooShort { .. }) => {}
            other => panic!("expected clean-length skip, got {other:?}"),
        }
        match fetch_detail_text(&session, "https://e/good", &config).await.unwrap() {
            DetailContent::Text(text) => assert!(text.contains("real notice text")),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn manager_relaunches_when_probe_fails_and_replays_navigation() {
        let first = ScriptedSession::new(vec![LISTING_HTML.to_string()]);
        first.kill();
        let second = ScriptedSession::new(vec![LISTING_HTML.to_string()]);
        let factory = ScriptedFactory::with_sessions(vec![first, second]);

        let mut manager = SessionManager::new(Box::new(factory), SessionProfile::default())
            .with_backoff(BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            });

        let session = manager
            .ensure_usable(Some("scripted://listing"))
            .await
            .expect("second session should come up");
        assert!(session.is_alive().await);
        assert!(!session.page_source().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manager_reports_fatal_when_factory_is_exhausted() {
        let factory = ScriptedFactory::with_sessions(Vec::new());
        let mut manager = SessionManager::new(Box::new(factory), SessionProfile::default())
            .with_backoff(BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            });

        let err = manager.ensure_usable(None).await.err().expect("must fail");
        assert!(err.to_string().contains("could not be reacquired"));
    }
}
