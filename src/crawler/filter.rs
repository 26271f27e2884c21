use std::collections::HashSet;
use regex::Regex;
use url::Url;
use tracing::{debug, warn};

use crate::cli::config::SearchSettings;

/// Decides which discovered links become work items, and in what canonical form
pub struct UrlFilter {
    /// Set of already accepted URLs to avoid duplicates
    seen_urls: HashSet<String>,

    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,

    /// Allowed domains (if empty, any domain is allowed)
    allowed_domains: HashSet<String>,

    /// Drop the query string entirely instead of sorting it
    strip_query: bool,

    /// Force the path to end with '/'
    trailing_slash: bool,
}

impl UrlFilter {
    /// Create a new filter from the search settings
    pub fn new(settings: &SearchSettings) -> Self {
        let include_patterns = Self::compile(&settings.url_patterns.include, "include");
        let exclude_patterns = Self::compile(&settings.url_patterns.exclude, "exclude");

        let allowed_domains = settings.allowed_domains.iter()
            .map(|domain| domain.to_lowercase())
            .collect();

        Self {
            seen_urls: HashSet::new(),
            include_patterns,
            exclude_patterns,
            allowed_domains,
            strip_query: settings.strip_query,
            trailing_slash: settings.trailing_slash,
        }
    }

    fn compile(patterns: &[String], kind: &str) -> Vec<Regex> {
        patterns.iter()
            .filter_map(|pattern| {
                match Regex::new(pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Canonical form of `url` if it passes the filter and was not seen before
    pub fn accept(&mut self, url: &str) -> Option<String> {
        let normalized_url = self.normalize_url(url)?;

        if self.seen_urls.contains(&normalized_url) {
            debug!("Skipping already seen URL: {}", normalized_url);
            return None;
        }

        if !self.matches(&normalized_url) {
            return None;
        }

        self.seen_urls.insert(normalized_url.clone());
        Some(normalized_url)
    }

    /// Domain and pattern checks on an already normalized URL
    fn matches(&self, normalized_url: &str) -> bool {
        if !self.allowed_domains.is_empty() {
            let host = Url::parse(normalized_url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_lowercase()));
            match host {
                Some(host) => {
                    if !self.allowed_domains.iter().any(|domain| host == *domain || host.ends_with(&format!(".{}", domain))) {
                        debug!("Skipping URL from non-allowed domain: {}", host);
                        return false;
                    }
                }
                None => {
                    debug!("Skipping URL without host: {}", normalized_url);
                    return false;
                }
            }
        }

        if self.exclude_patterns.iter().any(|p| p.is_match(normalized_url)) {
            debug!("Skipping URL matching exclusion pattern: {}", normalized_url);
            return false;
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(normalized_url))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", normalized_url);
            return false;
        }

        true
    }

    /// Normalize a URL so minor differences do not create duplicate work items
    pub fn normalize_url(&self, url: &str) -> Option<String> {
        let mut normalized = match Url::parse(url.trim()) {
            Ok(url) => url,
            Err(e) => {
                debug!("Skipping invalid URL {}: {}", url, e);
                return None;
            }
        };

        // Remove default ports
        if let Some(port) = normalized.port() {
            if (normalized.scheme() == "http" && port == 80) ||
               (normalized.scheme() == "https" && port == 443) {
                let _ = normalized.set_port(None);
            }
        }

        if self.trailing_slash && !normalized.path().ends_with('/') {
            let path = format!("{}/", normalized.path());
            normalized.set_path(&path);
        }

        if self.strip_query {
            normalized.set_query(None);
        } else if normalized.query().map_or(false, |q| !q.is_empty()) {
            // Sort query parameters by key
            let mut params: Vec<(String, String)> = normalized.query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            params.sort_by(|a, b| a.0.cmp(&b.0));
            normalized.query_pairs_mut().clear().extend_pairs(params);
        }

        // Remove fragments (anchors)
        normalized.set_fragment(None);

        Some(normalized.to_string())
    }

    /// Number of URLs accepted so far
    pub fn seen_count(&self) -> usize {
        self.seen_urls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{SearchSettings, UrlPatterns};

    fn create_test_settings(strip_query: bool, trailing_slash: bool) -> SearchSettings {
        SearchSettings {
            allowed_domains: vec!["example.com".to_string()],
            url_patterns: UrlPatterns {
                include: vec![r"^https?://(www\.)?example\.com/company/[^/]+/$".to_string()],
                exclude: vec![r"/search/".to_string()],
            },
            strip_query,
            trailing_slash,
            ..SearchSettings::default()
        }
    }

    #[test]
    fn test_accept() {
        let mut filter = UrlFilter::new(&create_test_settings(true, true));

        assert_eq!(
            filter.accept("https://www.example.com/company/acme?trk=results#about"),
            Some("https://www.example.com/company/acme/".to_string())
        );

        // Same company, different tracking parameters
        assert_eq!(filter.accept("https://www.example.com/company/acme/?trk=other"), None);

        // Other domains and excluded or non-matching paths
        assert_eq!(filter.accept("https://other-site.com/company/acme/"), None);
        assert_eq!(filter.accept("https://www.example.com/search/results/companies/"), None);
        assert_eq!(filter.accept("https://www.example.com/in/someone/"), None);
        assert_eq!(filter.accept("not a url"), None);

        assert!(filter.accept("https://www.example.com/company/initech").is_some());
        assert_eq!(filter.seen_count(), 2);
    }

    #[test]
    fn test_normalize_url() {
        let filter = UrlFilter::new(&create_test_settings(false, false));

        assert_eq!(
            filter.normalize_url("https://EXAMPLE.com/path").as_deref(),
            Some("https://example.com/path")
        );

        assert_eq!(
            filter.normalize_url("https://example.com:443/path").as_deref(),
            Some("https://example.com/path")
        );

        assert_eq!(
            filter.normalize_url("https://example.com/search?b=2&a=1").as_deref(),
            Some("https://example.com/search?a=1&b=2")
        );

        assert_eq!(
            filter.normalize_url("https://example.com/page#section").as_deref(),
            Some("https://example.com/page")
        );
    }
}
