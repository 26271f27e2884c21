use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};

use crate::crawler::rate_limit::RateLimitPolicy;
use crate::crawler::retry::RetryPolicy;

/// Upper bound on parallel browsers
pub const MAX_WORKERS: usize = 5;

/// Built-in profiles, one per crawl style
pub const PRESETS: &[&str] = &["general", "safe", "bulk", "people"];

/// What the target URLs point at
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Companies,
    People,
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub target: TargetKind,
    pub crawler: CrawlerSettings,
    pub browser: BrowserSettings,
    pub auth: AuthSettings,
    pub search: SearchSettings,
    pub storage: StorageSettings,
}

/// Coordinator settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CrawlerSettings {
    pub workers: usize,
    pub rate_limit: RateLimitPolicy,
    /// Consecutive failures after which a worker stops the pool
    pub failure_threshold: u32,
    /// Save the checkpoint after every N-th completed item
    pub checkpoint_interval: usize,
    pub retry: RetryPolicy,
}

/// Browser settings. Identity values are fixed, not randomized.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: String,
    pub viewport: Viewport,
    pub page_load_timeout_secs: u64,
    /// Wait after navigation before reading the page
    pub settle_delay_ms: u64,
    pub behavior: BrowserBehavior,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Human-like input timings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrowserBehavior {
    pub click_delay: (u64, u64),  // Min and max delay in milliseconds
    pub typing_speed: (u64, u64), // Min and max milliseconds per character
    pub scroll_steps: u32,
    pub scroll_pause: (u64, u64),
}

/// Login settings. Credentials themselves only ever come from the environment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuthSettings {
    pub login_url: String,
    /// Page that only renders for a logged-in session
    pub validation_url: String,
    pub email_env: String,
    pub password_env: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// URL fragments that mean the session was rejected
    pub blocked_markers: Vec<String>,
    /// URL fragments that mean a verification challenge is showing
    pub challenge_markers: Vec<String>,
    /// How long to leave a headed browser open for solving a challenge by hand
    pub manual_challenge_secs: u64,
    pub login_wait_secs: u64,
}

/// Search result collection settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SearchSettings {
    /// Template with `{keywords}` and `{page}` placeholders, and optionally `{location}`
    pub search_url: String,
    pub results_per_page: u32,
    pub allowed_domains: Vec<String>,
    pub url_patterns: UrlPatterns,
    pub strip_query: bool,
    pub trailing_slash: bool,
    pub page_delay: (u64, u64),
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// File locations, all relative to `data_dir`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub checkpoint_file: String,
    pub records_file: String,
    pub targets_file: String,
    pub collector_checkpoint_file: String,
    pub auth_state_file: String,
}

impl StorageSettings {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(&self.checkpoint_file)
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join(&self.records_file)
    }

    pub fn targets_path(&self) -> PathBuf {
        self.data_dir.join(&self.targets_file)
    }

    pub fn collector_checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(&self.collector_checkpoint_file)
    }

    pub fn auth_state_path(&self) -> PathBuf {
        self.data_dir.join(&self.auth_state_file)
    }
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            rate_limit: RateLimitPolicy::default(),
            failure_threshold: 3,
            checkpoint_interval: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            page_load_timeout_secs: 30,
            settle_delay_ms: 3000,
            behavior: BrowserBehavior {
                click_delay: (100, 300),
                typing_speed: (50, 150),
                scroll_steps: 3,
                scroll_pause: (600, 1000),
            },
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            login_url: "https://www.linkedin.com/login".to_string(),
            validation_url: "https://www.linkedin.com/feed/".to_string(),
            email_env: "LINKEDIN_EMAIL".to_string(),
            password_env: "LINKEDIN_PASSWORD".to_string(),
            username_selector: "#username".to_string(),
            password_selector: "#password".to_string(),
            submit_selector: "button[type=\"submit\"]".to_string(),
            blocked_markers: vec!["/login".to_string(), "/checkpoint".to_string(), "/authwall".to_string()],
            challenge_markers: vec!["/checkpoint".to_string(), "/challenge".to_string()],
            manual_challenge_secs: 120,
            login_wait_secs: 10,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            search_url: "https://www.linkedin.com/search/results/companies/?keywords={keywords}&origin=FACETED_SEARCH&page={page}".to_string(),
            results_per_page: 10,
            allowed_domains: vec!["linkedin.com".to_string()],
            url_patterns: UrlPatterns {
                include: vec![r"^https://[^/]+/company/[^/]+/$".to_string()],
                exclude: vec![r"/search/".to_string()],
            },
            strip_query: true,
            trailing_slash: true,
            page_delay: (10_000, 15_000),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("scraped-data"),
            checkpoint_file: "company-checkpoint.json".to_string(),
            records_file: "companies.json".to_string(),
            targets_file: "company-urls.json".to_string(),
            collector_checkpoint_file: "collect-checkpoint.json".to_string(),
            auth_state_file: "auth-state.json".to_string(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            target: TargetKind::default(),
            crawler: CrawlerSettings::default(),
            browser: BrowserSettings::default(),
            auth: AuthSettings::default(),
            search: SearchSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl CrawlerConfig {
    /// Built-in profile by name
    pub fn preset(name: &str) -> Option<Self> {
        let mut config = Self::default();
        match name {
            "general" => {}
            "safe" => {
                // One quiet browser, long pauses, bounded day and session
                config.crawler.workers = 1;
                config.crawler.rate_limit = RateLimitPolicy {
                    min_delay_ms: 30_000,
                    max_delay_ms: 60_000,
                    daily_limit: Some(100),
                    session_duration_ms: Some(2 * 60 * 60 * 1000),
                };
                config.storage.checkpoint_file = "safe-scraper-checkpoint.json".to_string();
                config.storage.records_file = "companies-safe.json".to_string();
                config.storage.auth_state_file = "auth-state-safe.json".to_string();
            }
            "bulk" => {
                config.crawler.workers = MAX_WORKERS;
                config.crawler.rate_limit.min_delay_ms = 17_000;
                config.crawler.rate_limit.max_delay_ms = 60_000;
                config.crawler.checkpoint_interval = 5;
                config.storage.checkpoint_file = "optimized-company-checkpoint.json".to_string();
                config.storage.records_file = "companies-optimized.json".to_string();
            }
            "people" => {
                config.target = TargetKind::People;
                config.crawler.rate_limit.min_delay_ms = 3_000;
                config.crawler.rate_limit.max_delay_ms = 7_000;
                config.crawler.checkpoint_interval = 50;
                config.search.search_url = "https://www.linkedin.com/search/results/people/?keywords={keywords}&origin=FACETED_SEARCH&page={page}".to_string();
                config.search.url_patterns.include = vec![r"^https://[^/]+/in/[^/]+/$".to_string()];
                config.storage.checkpoint_file = "profile-checkpoint.json".to_string();
                config.storage.records_file = "profiles.json".to_string();
                config.storage.targets_file = "profile-urls.json".to_string();
                config.storage.collector_checkpoint_file = "collect-profiles-checkpoint.json".to_string();
            }
            _ => return None,
        }
        Some(config)
    }

    /// Reject settings the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        let crawler = &self.crawler;
        if crawler.workers == 0 {
            anyhow::bail!("crawler.workers must be at least 1");
        }
        if crawler.rate_limit.min_delay_ms > crawler.rate_limit.max_delay_ms {
            anyhow::bail!(
                "crawler.rate_limit.min_delay_ms ({}) is larger than max_delay_ms ({})",
                crawler.rate_limit.min_delay_ms,
                crawler.rate_limit.max_delay_ms
            );
        }
        if crawler.checkpoint_interval == 0 {
            anyhow::bail!("crawler.checkpoint_interval must be at least 1");
        }
        if crawler.failure_threshold == 0 {
            anyhow::bail!("crawler.failure_threshold must be at least 1");
        }
        if self.search.results_per_page == 0 {
            anyhow::bail!("search.results_per_page must be at least 1");
        }
        Ok(())
    }

    /// Get the path to the config directory
    pub fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "resumable-crawler", "resumable-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile, falling back to a built-in preset
    pub fn load_profile(profile: &str) -> Result<Self> {
        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else if let Some(config) = Self::preset(profile) {
            debug!("Using built-in profile: {}", profile);
            Ok(config)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<PathBuf> {
        let sites_dir = Self::config_dir().join("sites");
        let profile_path = sites_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)?;
        Ok(profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List saved profiles plus the built-in presets
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        let mut profiles: Vec<String> = PRESETS.iter().map(|p| p.to_string()).collect();

        if !sites_dir.exists() {
            return Ok(profiles);
        }

        for entry in fs::read_dir(sites_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    if !profiles.iter().any(|p| p == name) {
                        profiles.push(name.to_string());
                    }
                }
            }
        }

        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for name in PRESETS {
            let config = CrawlerConfig::preset(name).unwrap();
            config.validate().unwrap();
        }
        assert!(CrawlerConfig::preset("missing").is_none());
    }

    #[test]
    fn test_safe_preset_has_quotas() {
        let config = CrawlerConfig::preset("safe").unwrap();
        assert_eq!(config.crawler.workers, 1);
        assert_eq!(config.crawler.rate_limit.daily_limit, Some(100));
        assert_eq!(config.crawler.rate_limit.session_duration_ms, Some(7_200_000));
    }

    #[test]
    fn test_people_preset_targets_profiles() {
        let config = CrawlerConfig::preset("people").unwrap();
        assert_eq!(config.target, TargetKind::People);
        assert!(config.search.search_url.contains("/search/results/people/"));
        assert_eq!(config.storage.records_path(), PathBuf::from("scraped-data/profiles.json"));

        let mut filter = crate::crawler::filter::UrlFilter::new(&config.search);
        assert_eq!(
            filter.accept("https://www.linkedin.com/in/jane-doe?miniProfileUrn=x"),
            Some("https://www.linkedin.com/in/jane-doe/".to_string())
        );
        assert_eq!(filter.accept("https://www.linkedin.com/company/acme/"), None);
    }

    #[test]
    fn test_target_kind_defaults_to_companies() {
        let mut yaml = serde_yaml::to_value(CrawlerConfig::default()).unwrap();
        yaml.as_mapping_mut().unwrap().remove("target");
        let config: CrawlerConfig = serde_yaml::from_value(yaml).unwrap();
        assert_eq!(config.target, TargetKind::Companies);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CrawlerConfig::default();
        config.crawler.workers = 0;
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.crawler.rate_limit.min_delay_ms = 10;
        config.crawler.rate_limit.max_delay_ms = 5;
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.crawler.checkpoint_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles").join("bulk.yaml");

        let config = CrawlerConfig::preset("bulk").unwrap();
        config.save_to_file(&path).unwrap();

        assert_eq!(CrawlerConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_storage_paths_live_under_data_dir() {
        let storage = StorageSettings {
            data_dir: PathBuf::from("/tmp/crawl"),
            ..StorageSettings::default()
        };
        assert_eq!(storage.checkpoint_path(), PathBuf::from("/tmp/crawl/company-checkpoint.json"));
        assert_eq!(storage.auth_state_path(), PathBuf::from("/tmp/crawl/auth-state.json"));
    }
}
