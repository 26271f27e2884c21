use anyhow::{bail, Context, Result};
use futures::stream::{self, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::adapter::{PageAdapter, PageKind};
use crate::browser::company::CompanyPage;
use crate::browser::profile::ProfilePage;
use crate::browser::auth::{AuthState, Authenticator, Credentials};
use crate::browser::session::BrowserSession;
use crate::cli::config::{CrawlerConfig, TargetKind, MAX_WORKERS};
use crate::cli::CrawlOverrides;
use crate::crawler::collector::{CollectorCheckpoint, SearchCollector, SearchQuery};
use crate::crawler::coordinator::CrawlCoordinator;
use crate::crawler::filter::UrlFilter;
use crate::crawler::targets::{load_targets, save_targets};
use crate::crawler::task::{CrawlSummary, PauseReason, WorkItem};
use crate::storage::checkpoint::{CheckpointStore, JsonCheckpointStore};
use crate::storage::records::RecordStore;

impl CrawlOverrides {
    /// Apply command line values on top of a loaded profile
    pub fn apply(&self, config: &mut CrawlerConfig) {
        if let Some(workers) = self.workers {
            if workers > MAX_WORKERS {
                warn!("{} workers requested, capping at {}", workers, MAX_WORKERS);
            }
            config.crawler.workers = workers.min(MAX_WORKERS);
        }
        if let Some(min) = self.delay_min {
            config.crawler.rate_limit.min_delay_ms = min.saturating_mul(1000);
        }
        if let Some(max) = self.delay_max {
            config.crawler.rate_limit.max_delay_ms = max.saturating_mul(1000);
        }
        if let Some(limit) = self.daily_limit {
            config.crawler.rate_limit.daily_limit = Some(limit);
        }
        if let Some(minutes) = self.session_minutes {
            config.crawler.rate_limit.session_duration_ms = Some(minutes.saturating_mul(60_000));
        }
        if self.headed {
            config.browser.headless = false;
        }
    }
}

fn load_config(profile: &str) -> Result<CrawlerConfig> {
    CrawlerConfig::load_profile(profile).context(format!("Failed to load profile: {}", profile))
}

/// Flip `stop` on the first signal. Returns true once a second signal arrives.
async fn relay_interrupts<S>(mut signals: S, stop: watch::Sender<bool>) -> bool
where
    S: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        return false;
    }
    warn!("Interrupt received, finishing in-flight items. Press Ctrl-C again to exit now");
    let _ = stop.send(true);

    signals.next().await.is_some()
}

/// Flip the returned receiver to `true` on Ctrl-C, exit on a second Ctrl-C
fn interrupt_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let signals = Box::pin(stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    }));
    tokio::spawn(async move {
        if relay_interrupts(signals, tx).await {
            warn!("Second interrupt, exiting without a final checkpoint save");
            std::process::exit(130);
        }
    });
    rx
}

/// Crawl the target list, resuming from the checkpoint
pub async fn crawl(
    profile: String,
    targets: Option<PathBuf>,
    limit: Option<usize>,
    overrides: CrawlOverrides,
) -> Result<()> {
    let mut config = load_config(&profile)?;
    overrides.apply(&mut config);
    config.validate()?;

    let storage = &config.storage;
    let targets_path = targets.unwrap_or_else(|| storage.targets_path());
    let mut filter = UrlFilter::new(&config.search);
    let items = load_targets(&targets_path, &mut filter, limit).await?;
    if items.is_empty() {
        bail!("No usable targets in {}", targets_path.display());
    }

    let auth_path = storage.auth_state_path();
    if AuthState::load(&auth_path).await?.is_none() {
        Credentials::from_env(&config.auth).context("No saved login and no credentials to log in with")?;
    }

    let auth = Arc::new(Authenticator::new(config.auth.clone(), auth_path));
    match config.target {
        TargetKind::Companies => run_crawl::<CompanyPage>(&config, items, auth).await,
        TargetKind::People => run_crawl::<ProfilePage>(&config, items, auth).await,
    }
}

async fn run_crawl<P: PageKind>(config: &CrawlerConfig, items: Vec<WorkItem>, auth: Arc<Authenticator>) -> Result<()> {
    let storage = &config.storage;
    let records: Arc<RecordStore<P::Record>> = Arc::new(RecordStore::open(storage.records_path()).await?);
    let adapter = Arc::new(PageAdapter::<P>::new(config, auth.clone(), records.clone()));
    let store: Arc<dyn CheckpointStore> = Arc::new(JsonCheckpointStore::new(storage.checkpoint_path()));

    info!(
        kind = ?config.target,
        records = %records.path().display(),
        workers = config.crawler.workers,
        min_delay_ms = config.crawler.rate_limit.min_delay_ms,
        max_delay_ms = config.crawler.rate_limit.max_delay_ms,
        "Crawling {} targets",
        items.len()
    );

    let summary = CrawlCoordinator::new(config.crawler.clone(), adapter, store)
        .with_shutdown(interrupt_signal())
        .run(items)
        .await?;

    println!("{}", summary_report(&summary, records.len().await));

    if summary.needs_reauthentication() {
        auth.invalidate().await?;
        bail!("Authentication is no longer valid. The saved login was removed; run again to log in.");
    }
    if summary.paused_reason == Some(PauseReason::SessionUnavailable) {
        bail!("No browser session could be opened. Check that the WebDriver server is running.");
    }

    Ok(())
}

fn summary_report<R>(summary: &CrawlSummary<R>, stored_records: usize) -> String {
    let outcome = match summary.paused_reason {
        None if summary.is_unfinished() => "Stopped with items left. Run again to continue.".to_string(),
        None => "Crawl finished.".to_string(),
        Some(PauseReason::Interrupted) => "Interrupted. Run the same command to resume.".to_string(),
        Some(PauseReason::DailyLimit) => "Daily limit reached. Resume tomorrow.".to_string(),
        Some(PauseReason::SessionTimeout) => "Session time is up. Run again to continue.".to_string(),
        Some(reason) => format!("Paused: {}", reason),
    };

    format!(
        "Completed: {}\nFailed:    {}\nRemaining: {}\nRecords stored: {}\n{}",
        summary.completed_count, summary.failed_count, summary.remaining_count, stored_records, outcome
    )
}

/// Collect target URLs from search results and write them as the target list
pub async fn collect(query: SearchQuery, profile: String, limit: usize, restart: bool, headed: bool) -> Result<()> {
    let mut config = load_config(&profile)?;
    if headed {
        config.browser.headless = false;
    }
    config.validate()?;

    let storage = &config.storage;
    let collector = SearchCollector::new(
        config.search.clone(),
        config.crawler.retry.clone(),
        storage.collector_checkpoint_path(),
    );
    if restart {
        collector.reset().await?;
    }

    let auth = Authenticator::new(config.auth.clone(), storage.auth_state_path());
    let mut session = BrowserSession::connect(config.browser.clone()).await?;

    let result = async {
        auth.ensure_login(&session).await?;
        collector.collect(&session, &query, limit).await
    }
    .await;
    session.close().await?;
    let urls = result?;

    let targets_path = storage.targets_path();
    save_targets(&targets_path, &urls).await?;
    println!("Collected {} URLs into {}", urls.len(), targets_path.display());

    Ok(())
}

/// Show checkpoint progress for a profile
pub async fn status(profile: String) -> Result<()> {
    let config = load_config(&profile)?;
    let storage = &config.storage;

    let store = JsonCheckpointStore::new(storage.checkpoint_path());
    let checkpoint = store.load().await?;
    let remaining = checkpoint
        .target_urls
        .iter()
        .filter(|item| !checkpoint.is_completed(item))
        .count();

    println!("Checkpoint: {}", store.path().display());
    println!("Targets:    {}", checkpoint.total_urls);
    println!("Completed:  {}", checkpoint.completed_urls.len());
    println!("Failed:     {}", checkpoint.failed_urls.len());
    println!("Remaining:  {}", remaining);
    println!("Today:      {}", checkpoint.daily_count());
    println!("Last saved: {}", checkpoint.timestamp);

    let stored = match config.target {
        TargetKind::Companies => stored_records::<CompanyPage>(&storage.records_path()).await?,
        TargetKind::People => stored_records::<ProfilePage>(&storage.records_path()).await?,
    };
    println!("Records:    {} in {}", stored, storage.records_path().display());

    if let Some(collection) = CollectorCheckpoint::load(&storage.collector_checkpoint_path()).await? {
        println!(
            "Collection: {} URLs, last page {}{}",
            collection.urls.len(),
            collection.last_page,
            if collection.completed { " (completed)" } else { "" }
        );
    }

    let login = match AuthState::load(&storage.auth_state_path()).await? {
        Some(state) => format!("saved {}", state.saved_at),
        None => "none".to_string(),
    };
    println!("Login:      {}", login);

    Ok(())
}

async fn stored_records<P: PageKind>(path: &Path) -> Result<usize> {
    let records: RecordStore<P::Record> = RecordStore::open(path).await?;
    Ok(records.len().await)
}

/// Delete crawl progress, optionally with the saved login and collection progress
pub async fn reset(profile: String, auth: bool, collector: bool) -> Result<()> {
    let config = load_config(&profile)?;
    let storage = &config.storage;

    JsonCheckpointStore::new(storage.checkpoint_path()).clear().await?;
    println!("Removed checkpoint {}", storage.checkpoint_path().display());

    if auth && AuthState::delete(&storage.auth_state_path()).await? {
        println!("Removed saved login {}", storage.auth_state_path().display());
    }

    if collector {
        SearchCollector::new(
            config.search.clone(),
            config.crawler.retry.clone(),
            storage.collector_checkpoint_path(),
        )
        .reset()
        .await?;
        println!("Removed collection progress {}", storage.collector_checkpoint_path().display());
    }

    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, writing it out first if it only exists as a preset or not at all
pub fn manage_profile(profile_name: String) -> Result<()> {
    let profile_path = CrawlerConfig::config_dir()
        .join("sites")
        .join(format!("{}.yaml", profile_name));

    if profile_path.exists() {
        let config = CrawlerConfig::load_from_file(&profile_path)?;
        println!("Profile: {}", profile_name);
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let config = match CrawlerConfig::preset(&profile_name) {
        Some(config) => config,
        None => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            CrawlerConfig::default()
        }
    };
    let path = config.save_as_profile(&profile_name)?;
    println!("Created profile {} at {}", profile_name, path.display());

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let mut config = CrawlerConfig::default();
        let overrides = CrawlOverrides {
            workers: Some(12),
            delay_min: Some(5),
            delay_max: Some(9),
            daily_limit: Some(40),
            session_minutes: Some(30),
            headed: true,
        };

        overrides.apply(&mut config);

        assert_eq!(config.crawler.workers, MAX_WORKERS);
        assert_eq!(config.crawler.rate_limit.min_delay_ms, 5000);
        assert_eq!(config.crawler.rate_limit.max_delay_ms, 9000);
        assert_eq!(config.crawler.rate_limit.daily_limit, Some(40));
        assert_eq!(config.crawler.rate_limit.session_duration_ms, Some(1_800_000));
        assert!(!config.browser.headless);
    }

    #[test]
    fn test_empty_overrides_keep_profile() {
        let mut config = CrawlerConfig::preset("safe").unwrap();
        let before = config.clone();

        CrawlOverrides::default().apply(&mut config);

        assert_eq!(config, before);
    }

    #[test]
    fn test_overrides_saturate_huge_values() {
        let mut config = CrawlerConfig::default();
        CrawlOverrides {
            delay_min: Some(u64::MAX),
            delay_max: Some(u64::MAX),
            session_minutes: Some(u64::MAX / 2),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.crawler.rate_limit.min_delay_ms, u64::MAX);
        assert_eq!(config.crawler.rate_limit.max_delay_ms, u64::MAX);
        assert_eq!(config.crawler.rate_limit.session_duration_ms, Some(u64::MAX));
    }

    fn summary(remaining: usize, paused: Option<PauseReason>) -> CrawlSummary<()> {
        CrawlSummary {
            completed_count: 2,
            failed_count: 1,
            remaining_count: remaining,
            paused_reason: paused,
            records: Vec::new(),
        }
    }

    #[test]
    fn test_summary_report_outcomes() {
        assert!(summary_report(&summary(0, None), 2).ends_with("Crawl finished."));
        assert!(summary_report(&summary(4, None), 2).ends_with("Stopped with items left. Run again to continue."));
        assert!(summary_report(&summary(4, Some(PauseReason::SessionUnavailable)), 2)
            .ends_with("Paused: no browser session could be opened"));

        let report = summary_report(&summary(4, Some(PauseReason::DailyLimit)), 7);
        assert!(report.contains("Remaining: 4"));
        assert!(report.contains("Records stored: 7"));
        assert!(report.ends_with("Daily limit reached. Resume tomorrow."));
    }

    #[tokio::test]
    async fn test_first_interrupt_stops_second_exits() {
        let (signals, incoming) = futures::channel::mpsc::unbounded();
        let (tx, mut rx) = watch::channel(false);
        let relay = tokio::spawn(relay_interrupts(incoming, tx));

        signals.unbounded_send(()).unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(!relay.is_finished());

        signals.unbounded_send(()).unwrap();
        assert!(relay.await.unwrap());
    }

    #[tokio::test]
    async fn test_interrupt_relay_without_signals() {
        let (signals, incoming) = futures::channel::mpsc::unbounded::<()>();
        let (tx, rx) = watch::channel(false);
        drop(signals);

        assert!(!relay_interrupts(incoming, tx).await);
        assert!(!*rx.borrow());
    }

    #[test]
    fn test_overrides_can_make_config_invalid() {
        let mut config = CrawlerConfig::default();
        CrawlOverrides {
            delay_min: Some(10),
            delay_max: Some(1),
            ..Default::default()
        }
        .apply(&mut config);

        assert!(config.validate().is_err());
    }
}
