use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::behavior::sample_ms;
use crate::browser::session::BrowserSession;
use crate::cli::config::SearchSettings;
use crate::crawler::filter::UrlFilter;
use crate::crawler::retry::RetryPolicy;
use crate::crawler::task::WorkItem;
use crate::storage::atomic::write_atomic_async;

/// Progress of a search collection, saved after every result page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorCheckpoint {
    #[serde(default)]
    pub last_page: u32,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub completed: bool,
}

impl CollectorCheckpoint {
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents).with_context(|| {
                format!("Failed to parse collector checkpoint: {}", path.display())
            })?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read collector checkpoint: {}", path.display())),
        }
    }

    pub async fn save(&mut self, path: &Path) -> Result<()> {
        self.timestamp = Utc::now();
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic_async(path.to_path_buf(), json)
            .await
            .with_context(|| format!("Failed to write collector checkpoint: {}", path.display()))
    }
}

/// Source of rendered search result pages
#[async_trait]
pub trait SearchPages: Sync {
    async fn fetch_page(&self, url: &str) -> Result<String>;
}

#[async_trait]
impl SearchPages for BrowserSession {
    async fn fetch_page(&self, url: &str) -> Result<String> {
        self.navigate(url).await?;
        self.settle().await;
        if let Err(e) = self.scroll().await {
            debug!("Scroll failed: {}", e);
        }
        self.page_source().await
    }
}

/// What to search for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub keywords: String,
    pub location: Option<String>,
}

impl SearchQuery {
    pub fn new(keywords: impl Into<String>, location: Option<String>) -> Self {
        Self {
            keywords: keywords.into(),
            location: location.filter(|l| !l.trim().is_empty()),
        }
    }
}

fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Fill the search template. Values are form-encoded.
///
/// A template with a `{location}` slot gets the location there; otherwise
/// the location is appended to the keywords.
pub fn search_url(template: &str, query: &SearchQuery, page: u32) -> String {
    let location = query.location.as_deref().unwrap_or_default();
    let keywords = if template.contains("{location}") || location.is_empty() {
        query.keywords.clone()
    } else {
        format!("{} {}", query.keywords, location)
    };

    template
        .replace("{keywords}", &form_encode(&keywords))
        .replace("{location}", &form_encode(location))
        .replace("{page}", &page.to_string())
}

/// Pages needed to reach `limit` results
pub fn max_pages(limit: usize, results_per_page: u32) -> u32 {
    let per_page = results_per_page.max(1) as usize;
    ((limit + per_page - 1) / per_page) as u32
}

/// Absolute `href`s of every link on the page
pub fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| match &base {
            Some(base) => base.join(href).ok().map(|u| u.to_string()),
            None => Url::parse(href).ok().map(|u| u.to_string()),
        })
        .collect()
}

/// Paginates a search and gathers profile links into a target list
pub struct SearchCollector {
    settings: SearchSettings,
    retry: RetryPolicy,
    checkpoint_path: PathBuf,
}

impl SearchCollector {
    pub fn new(settings: SearchSettings, retry: RetryPolicy, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            retry,
            checkpoint_path: checkpoint_path.into(),
        }
    }

    /// Collect up to `limit` URLs, resuming from the collector checkpoint.
    ///
    /// Stops at the limit, at the first page without new matching links, or
    /// after `ceil(limit / results_per_page)` pages.
    pub async fn collect<P: SearchPages>(&self, pages: &P, query: &SearchQuery, limit: usize) -> Result<Vec<WorkItem>> {
        let mut filter = UrlFilter::new(&self.settings);
        let mut checkpoint = match CollectorCheckpoint::load(&self.checkpoint_path).await? {
            Some(checkpoint) if checkpoint.completed => {
                info!(urls = checkpoint.urls.len(), "Collection already completed");
                return Ok(checkpoint.urls.into_iter().take(limit).map(WorkItem::from).collect());
            }
            Some(checkpoint) => {
                info!(
                    last_page = checkpoint.last_page,
                    urls = checkpoint.urls.len(),
                    "Resuming collection"
                );
                checkpoint
            }
            None => CollectorCheckpoint {
                last_page: 0,
                urls: Vec::new(),
                timestamp: Utc::now(),
                completed: false,
            },
        };

        for url in &checkpoint.urls {
            filter.accept(url);
        }

        let max_pages = max_pages(limit, self.settings.results_per_page);
        let mut page = checkpoint.last_page + 1;

        while checkpoint.urls.len() < limit && page <= max_pages {
            let url = search_url(&self.settings.search_url, query, page);
            info!(page, max_pages, found = checkpoint.urls.len(), "Fetching search page");

            let target = url.as_str();
            let html = self
                .retry
                .run("search page", move |_| pages.fetch_page(target))
                .await?;

            let mut added = 0;
            for link in extract_links(&html, &url) {
                if checkpoint.urls.len() >= limit {
                    break;
                }
                if let Some(accepted) = filter.accept(&link) {
                    checkpoint.urls.push(accepted);
                    added += 1;
                }
            }

            checkpoint.last_page = page;
            checkpoint.save(&self.checkpoint_path).await?;

            if added == 0 {
                warn!(page, "No new results on page, stopping");
                break;
            }
            debug!(page, added, seen = filter.seen_count(), "Collected page");

            page += 1;
            if checkpoint.urls.len() < limit && page <= max_pages {
                sleep(Duration::from_millis(sample_ms(self.settings.page_delay))).await;
            }
        }

        checkpoint.completed = true;
        checkpoint.save(&self.checkpoint_path).await?;
        info!(urls = checkpoint.urls.len(), pages = checkpoint.last_page, "Collection finished");

        Ok(checkpoint.urls.into_iter().map(WorkItem::from).collect())
    }

    /// Forget collection progress
    pub async fn reset(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.checkpoint_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove collector checkpoint"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::UrlPatterns;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned pages keyed by page number
    struct FakePages {
        pages: HashMap<u32, Vec<&'static str>>,
        requested: Mutex<Vec<u32>>,
    }

    impl FakePages {
        fn new(pages: Vec<(u32, Vec<&'static str>)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<u32> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SearchPages for FakePages {
        async fn fetch_page(&self, url: &str) -> Result<String> {
            let page: u32 = Url::parse(url)?
                .query_pairs()
                .find(|(k, _)| k == "page")
                .and_then(|(_, v)| v.parse().ok())
                .context("no page parameter")?;
            self.requested.lock().unwrap().push(page);

            let links: String = self
                .pages
                .get(&page)
                .map(|slugs| {
                    slugs
                        .iter()
                        .map(|slug| format!(r#"<a href="/company/{}/?trk=search">{}</a>"#, slug, slug))
                        .collect()
                })
                .unwrap_or_default();
            Ok(format!(
                r#"<html><body><a href="/search/results/companies/?page=2">next</a>{}</body></html>"#,
                links
            ))
        }
    }

    fn settings() -> SearchSettings {
        SearchSettings {
            search_url: "https://www.example.com/search/results/companies/?keywords={keywords}&page={page}".to_string(),
            results_per_page: 2,
            allowed_domains: vec!["example.com".to_string()],
            url_patterns: UrlPatterns {
                include: vec![r"^https://[^/]+/company/[^/]+/$".to_string()],
                exclude: vec![r"/search/".to_string()],
            },
            strip_query: true,
            trailing_slash: true,
            page_delay: (0, 0),
        }
    }

    fn collector(dir: &Path) -> SearchCollector {
        SearchCollector::new(settings(), RetryPolicy::default(), dir.join("collect-checkpoint.json"))
    }

    fn query(keywords: &str) -> SearchQuery {
        SearchQuery::new(keywords, None)
    }

    #[test]
    fn test_search_url() {
        assert_eq!(
            search_url("https://x.test/?keywords={keywords}&page={page}", &query("software & data"), 3),
            "https://x.test/?keywords=software+%26+data&page=3"
        );
    }

    #[test]
    fn test_search_url_appends_location_to_keywords() {
        let query = SearchQuery::new("software", Some("Bangkok, Thailand".to_string()));
        assert_eq!(
            search_url("https://x.test/?keywords={keywords}&page={page}", &query, 1),
            "https://x.test/?keywords=software+Bangkok%2C+Thailand&page=1"
        );
    }

    #[test]
    fn test_search_url_fills_location_slot() {
        let template = "https://x.test/?keywords={keywords}&geo={location}&page={page}";
        let with_location = SearchQuery::new("software", Some("Bangkok".to_string()));
        assert_eq!(
            search_url(template, &with_location, 2),
            "https://x.test/?keywords=software&geo=Bangkok&page=2"
        );
        assert_eq!(
            search_url(template, &SearchQuery::new("software", Some("  ".to_string())), 2),
            "https://x.test/?keywords=software&geo=&page=2"
        );
    }

    #[test]
    fn test_max_pages() {
        assert_eq!(max_pages(25, 10), 3);
        assert_eq!(max_pages(20, 10), 2);
        assert_eq!(max_pages(5, 0), 5);
    }

    #[test]
    fn test_extract_links_resolves_relative() {
        let links = extract_links(
            r#"<a href="/company/acme/">a</a><a href="https://other.test/x">b</a>"#,
            "https://www.example.com/search/?page=1",
        );
        assert_eq!(links, vec!["https://www.example.com/company/acme/", "https://other.test/x"]);
    }

    #[tokio::test]
    async fn test_collect_stops_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let pages = FakePages::new(vec![(1, vec!["a", "b"]), (2, vec!["c", "d"]), (3, vec!["e", "f"])]);

        let urls = collector(dir.path()).collect(&pages, &query("software"), 3).await.unwrap();

        assert_eq!(
            urls,
            vec![
                WorkItem::from("https://www.example.com/company/a/"),
                WorkItem::from("https://www.example.com/company/b/"),
                WorkItem::from("https://www.example.com/company/c/"),
            ]
        );
        assert_eq!(pages.requested(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_collect_stops_at_empty_page() {
        let dir = tempfile::tempdir().unwrap();
        let pages = FakePages::new(vec![(1, vec!["a", "b"])]);

        let urls = collector(dir.path()).collect(&pages, &query("software"), 10).await.unwrap();

        assert_eq!(urls.len(), 2);
        assert_eq!(pages.requested(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_collect_resumes_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        let mut saved = CollectorCheckpoint {
            last_page: 1,
            urls: vec!["https://www.example.com/company/a/".to_string()],
            timestamp: Utc::now(),
            completed: false,
        };
        saved.save(&dir.path().join("collect-checkpoint.json")).await.unwrap();

        let pages = FakePages::new(vec![(2, vec!["a", "b"]), (3, vec!["c"])]);
        let urls = collector.collect(&pages, &query("software"), 4).await.unwrap();

        assert_eq!(pages.requested(), vec![2]);
        assert_eq!(urls.len(), 2);

        let checkpoint = CollectorCheckpoint::load(&dir.path().join("collect-checkpoint.json"))
            .await
            .unwrap()
            .unwrap();
        assert!(checkpoint.completed);
        assert_eq!(checkpoint.last_page, 2);
    }

    #[tokio::test]
    async fn test_completed_collection_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        let pages = FakePages::new(vec![(1, vec!["a", "b"])]);

        collector.collect(&pages, &query("software"), 2).await.unwrap();
        let again = collector.collect(&pages, &query("software"), 2).await.unwrap();

        assert_eq!(again.len(), 2);
        assert_eq!(pages.requested(), vec![1]);

        collector.reset().await.unwrap();
        collector.collect(&pages, &query("software"), 2).await.unwrap();
        assert_eq!(pages.requested(), vec![1, 1]);
    }
}
