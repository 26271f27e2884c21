use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::auth::Authenticator;
use crate::browser::session::BrowserSession;
use crate::cli::config::{BrowserSettings, CrawlerConfig};
use crate::crawler::coordinator::ExtractionAdapter;
use crate::crawler::retry::RetryPolicy;
use crate::crawler::task::{Extraction, WorkItem};
use crate::storage::records::{Keyed, RecordStore};

/// One kind of page the crawler knows how to read
pub trait PageKind: Send + Sync + 'static {
    type Record: Keyed + Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Page to load for a target
    fn page_url(item: &WorkItem) -> String;

    /// `None` when the page holds no usable record
    fn parse(html: &str, item: &WorkItem) -> Option<Self::Record>;
}

pub(crate) fn clean_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of the first non-empty match among `selectors`
pub(crate) fn first_text(document: &Html, selectors: &[&str]) -> String {
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| {
            document
                .select(&selector)
                .map(clean_text)
                .find(|text| !text.is_empty())
        })
        .unwrap_or_default()
}

/// First capture group of `pattern`, or the whole match
pub(crate) fn first_match(pattern: &str, text: &str) -> Option<String> {
    let regex = Regex::new(pattern).ok()?;
    let captures = regex.captures(text)?;
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().to_string())
}

/// Path segment following `/<prefix>/` in a URL, e.g. `acme` for `/company/acme/`
pub(crate) fn path_slug(url: &str, prefix: &str) -> Option<String> {
    let rest = url.split(&format!("/{}/", prefix)).nth(1)?;
    let slug = rest.split(['/', '?', '#']).next()?;
    if slug.is_empty() {
        None
    } else {
        Some(slug.to_string())
    }
}

/// Browser session plus the index of the worker that owns it
pub struct PageSession {
    worker: usize,
    browser: BrowserSession,
}

/// Visits one kind of page and stores one record per target
pub struct PageAdapter<P: PageKind> {
    browser: BrowserSettings,
    retry: RetryPolicy,
    auth: Arc<Authenticator>,
    records: Arc<RecordStore<P::Record>>,
    login_gate: Mutex<()>,
    kind: PhantomData<fn() -> P>,
}

impl<P: PageKind> PageAdapter<P> {
    pub fn new(config: &CrawlerConfig, auth: Arc<Authenticator>, records: Arc<RecordStore<P::Record>>) -> Self {
        Self {
            browser: config.browser.clone(),
            retry: config.crawler.retry.clone(),
            auth,
            records,
            login_gate: Mutex::new(()),
            kind: PhantomData,
        }
    }
}

#[async_trait]
impl<P: PageKind> ExtractionAdapter for PageAdapter<P> {
    type Session = PageSession;
    type Record = P::Record;

    async fn open_session(&self, worker: usize) -> Result<PageSession> {
        let browser = BrowserSession::connect(self.browser.clone()).await?;

        // One login at a time; later workers pick up the saved cookies
        {
            let _gate = self.login_gate.lock().await;
            self.auth.ensure_login(&browser).await?;
        }

        info!(worker, "Browser session logged in");
        Ok(PageSession { worker, browser })
    }

    async fn extract(&self, session: &mut PageSession, item: &WorkItem) -> Result<Extraction<P::Record>> {
        let page_url = P::page_url(item);
        let browser = &session.browser;
        let target = page_url.as_str();

        self.retry
            .run("navigate", move |_| browser.navigate(target))
            .await?;
        browser.settle().await;

        let landed = browser.current_url().await?;
        if self.auth.is_blocked_url(&landed) {
            return Ok(Extraction::AuthInvalidated { url: landed });
        }

        if let Err(e) = browser.scroll().await {
            debug!(worker = session.worker, "Scroll failed: {}", e);
        }

        let html = browser.page_source().await?;
        let record = match P::parse(&html, item) {
            Some(record) => record,
            None => return Ok(Extraction::Empty),
        };

        self.records
            .upsert(record.clone())
            .await
            .map_err(|e| anyhow!("Failed to store {}: {:#}", record.key(), e))?;
        Ok(Extraction::Record(record))
    }

    async fn session_valid(&self, session: &mut PageSession) -> bool {
        match self.auth.validate(&session.browser).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(worker = session.worker, "Session check failed: {:#}", e);
                false
            }
        }
    }

    async fn close_session(&self, mut session: PageSession) {
        if let Err(e) = session.browser.close().await {
            warn!(worker = session.worker, "Failed to close browser: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_text_skips_empty_matches() {
        let document = Html::parse_document("<h1> </h1><h2>  Acme \n Corp </h2>");
        assert_eq!(first_text(&document, &["h1", "h2"]), "Acme Corp");
        assert_eq!(first_text(&document, &["h3", "[invalid"]), "");
    }

    #[test]
    fn test_first_match() {
        assert_eq!(first_match(r"(\d{4})", "Founded in 1949").as_deref(), Some("1949"));
        assert_eq!(first_match(r"\d+", "about 12 people").as_deref(), Some("12"));
        assert_eq!(first_match(r"\d+", "none"), None);
    }

    #[test]
    fn test_path_slug() {
        assert_eq!(path_slug("https://www.example.com/company/acme/", "company").as_deref(), Some("acme"));
        assert_eq!(path_slug("https://www.example.com/in/jane-doe?trk=x", "in").as_deref(), Some("jane-doe"));
        assert_eq!(path_slug("https://www.example.com/in/", "in"), None);
        assert_eq!(path_slug("https://www.example.com/company/acme/", "in"), None);
    }
}
