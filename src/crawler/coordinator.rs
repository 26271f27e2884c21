use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cli::config::CrawlerSettings;
use crate::crawler::rate_limit::RateLimiter;
use crate::crawler::task::{CrawlSummary, Extraction, PauseReason, WorkItem, WorkerState};
use crate::storage::checkpoint::{reconcile, Checkpoint, CheckpointError, CheckpointStore};
use crate::utils::MetricsCollector;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid crawl settings: {0}")]
    Config(String),
}

/// Returned by [`ExtractionAdapter::open_session`] when the site turned the login down
#[derive(Debug, Error)]
#[error("login was rejected, browser ended on {url}")]
pub struct LoginRejected {
    pub url: String,
}

/// Turns a loaded page into a structured record.
///
/// Each worker owns one session for its whole lifetime; `close_session` is
/// called on every exit path once the session was opened.
#[async_trait]
pub trait ExtractionAdapter: Send + Sync + 'static {
    /// Per-worker browsing context
    type Session: Send + 'static;

    /// Structured result of one item
    type Record: Send + 'static;

    /// Errors carrying [`LoginRejected`] stop the whole pool for re-authentication
    async fn open_session(&self, worker: usize) -> Result<Self::Session>;

    /// Extract one item. Errors are treated exactly like [`Extraction::Empty`].
    async fn extract(
        &self,
        session: &mut Self::Session,
        item: &WorkItem,
    ) -> Result<Extraction<Self::Record>>;

    /// Probe used after repeated failures to tell a dead login from bad pages
    async fn session_valid(&self, _session: &mut Self::Session) -> bool {
        true
    }

    async fn close_session(&self, session: Self::Session);
}

/// Mutable run state shared by all workers
struct SharedState<R> {
    queue: VecDeque<WorkItem>,
    checkpoint: Checkpoint,
    records: Vec<R>,
    completed: usize,
    failed: usize,
    in_flight: usize,
    unsaved: usize,
    open_failures: usize,
    pause: Option<PauseReason>,
    fatal: Option<CheckpointError>,
}

/// Everything a worker needs, shared behind one `Arc`
struct RunContext<A: ExtractionAdapter> {
    adapter: Arc<A>,
    store: Arc<dyn CheckpointStore>,
    limiter: RateLimiter,
    settings: CrawlerSettings,
    session_start: Instant,
    shared: Mutex<SharedState<A::Record>>,
    stop: Notify,
    shutdown: Option<watch::Receiver<bool>>,
    metrics: MetricsCollector,
}

/// Runs a pool of workers over a resumable work queue
pub struct CrawlCoordinator<A: ExtractionAdapter> {
    settings: CrawlerSettings,
    adapter: Arc<A>,
    store: Arc<dyn CheckpointStore>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<A: ExtractionAdapter> CrawlCoordinator<A> {
    pub fn new(settings: CrawlerSettings, adapter: Arc<A>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            settings,
            adapter,
            store,
            shutdown: None,
        }
    }

    /// Stop cooperatively once the receiver flips to `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn validate(&self) -> Result<(), CrawlError> {
        let s = &self.settings;
        if s.workers == 0 {
            return Err(CrawlError::Config("worker count must be at least 1".into()));
        }
        if s.rate_limit.min_delay_ms > s.rate_limit.max_delay_ms {
            return Err(CrawlError::Config("min delay is larger than max delay".into()));
        }
        if s.checkpoint_interval == 0 || s.failure_threshold == 0 {
            return Err(CrawlError::Config(
                "checkpoint interval and failure threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Crawl every target not yet completed according to the checkpoint.
    ///
    /// Returns a summary on normal completion and on every kind of pause.
    /// Only checkpoint store failures are returned as errors.
    pub async fn run(&self, targets: Vec<WorkItem>) -> Result<CrawlSummary<A::Record>, CrawlError> {
        self.validate()?;
        let span = info_span!("crawl", run_id = %Uuid::new_v4());
        self.run_inner(targets).instrument(span).await
    }

    async fn run_inner(&self, targets: Vec<WorkItem>) -> Result<CrawlSummary<A::Record>, CrawlError> {
        let mut checkpoint = self.store.load().await?;
        checkpoint.roll_day(&Local::now());

        let added = checkpoint.merge_targets(&targets);
        let pending = reconcile(&checkpoint, &targets);

        info!(
            targets = targets.len(),
            new = added,
            already_completed = checkpoint.completed_urls.len(),
            pending = pending.len(),
            completed_today = checkpoint.daily_count(),
            "Starting crawl"
        );

        checkpoint.touch(Utc::now());
        self.store.save(&checkpoint).await?;

        if pending.is_empty() {
            info!("All targets already completed");
            return Ok(CrawlSummary {
                completed_count: 0,
                failed_count: 0,
                remaining_count: 0,
                paused_reason: None,
                records: Vec::new(),
            });
        }

        let worker_count = self.settings.workers.min(pending.len());
        let ctx = Arc::new(RunContext::new(
            self.adapter.clone(),
            self.store.clone(),
            self.settings.clone(),
            checkpoint,
            pending,
            self.shutdown.clone(),
        ));

        let watcher = ctx.shutdown.clone().map(|mut rx| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                loop {
                    let stop = *rx.borrow();
                    if stop {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
                ctx.request_pause(PauseReason::Interrupted).await;
            })
        });

        info!("Starting {} workers", worker_count);
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let ctx = ctx.clone();
            workers.spawn(run_worker(id, ctx).instrument(info_span!("worker", id)));
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(state) => debug!(worker = state.id, processed = state.processed, "Worker stopped"),
                Err(e) => error!("Worker task failed: {}", e),
            }
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }

        let mut shared = ctx.shared.lock().await;
        if let Some(err) = shared.fatal.take() {
            error!("Crawl aborted: {}", err);
            return Err(err.into());
        }

        // Every worker is gone but work is left: no session could be kept open
        if shared.pause.is_none() && !shared.queue.is_empty() {
            warn!(
                open_failures = shared.open_failures,
                remaining = shared.queue.len(),
                "Workers stopped with items left"
            );
            shared.pause = Some(PauseReason::SessionUnavailable);
        }

        shared.checkpoint.touch(Utc::now());
        self.store.save(&shared.checkpoint).await?;

        let metrics = ctx.metrics.get_metrics().await;
        info!(
            completed = shared.completed,
            failed = shared.failed,
            remaining = shared.queue.len(),
            completed_today = shared.checkpoint.daily_count(),
            items_per_minute = %format!("{:.2}", metrics.items_per_minute()),
            avg_item_ms = metrics.average_duration_ms(),
            success_rate = %format!("{:.2}", metrics.success_rate()),
            paused = ?shared.pause,
            "Crawl finished"
        );

        Ok(CrawlSummary {
            completed_count: shared.completed,
            failed_count: shared.failed,
            remaining_count: shared.queue.len(),
            paused_reason: shared.pause,
            records: std::mem::take(&mut shared.records),
        })
    }
}

impl<A: ExtractionAdapter> RunContext<A> {
    fn new(
        adapter: Arc<A>,
        store: Arc<dyn CheckpointStore>,
        settings: CrawlerSettings,
        checkpoint: Checkpoint,
        pending: Vec<WorkItem>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            adapter,
            store,
            limiter: RateLimiter::new(settings.rate_limit.clone()),
            settings,
            session_start: Instant::now(),
            shared: Mutex::new(SharedState {
                queue: pending.into(),
                checkpoint,
                records: Vec::new(),
                completed: 0,
                failed: 0,
                in_flight: 0,
                unsaved: 0,
                open_failures: 0,
                pause: None,
                fatal: None,
            }),
            stop: Notify::new(),
            shutdown,
            metrics: MetricsCollector::new(),
        }
    }

    /// Take the next item, or `None` once the pool has to stop.
    ///
    /// The pause check and the pop happen under one lock so no two workers
    /// can claim the same item.
    async fn claim(&self) -> Option<WorkItem> {
        let mut shared = self.shared.lock().await;
        if shared.fatal.is_some() || shared.pause.is_some() || shared.queue.is_empty() {
            return None;
        }

        if self.shutdown.as_ref().map_or(false, |rx| *rx.borrow()) {
            info!("Interrupt received, draining workers");
            shared.pause = Some(PauseReason::Interrupted);
            self.stop.notify_waiters();
            return None;
        }

        shared.checkpoint.roll_day(&Local::now());

        // In-flight items count against the quota so it cannot be overshot
        let committed = shared.checkpoint.daily_count() + shared.in_flight as u32;
        if let Some(reason) = self.limiter.should_pause(self.session_start, Instant::now(), committed) {
            info!(completed_today = committed, "Pausing crawl: {}", reason);
            shared.pause = Some(reason);
            self.stop.notify_waiters();
            return None;
        }

        let item = shared.queue.pop_front()?;
        shared.in_flight += 1;
        Some(item)
    }

    async fn complete(&self, item: &WorkItem, record: A::Record) {
        let mut shared = self.shared.lock().await;
        shared.in_flight -= 1;
        shared.completed += 1;
        shared.checkpoint.mark_completed(item);
        shared.records.push(record);
        self.record_outcome(&mut shared).await;
    }

    async fn fail(&self, item: &WorkItem) {
        let mut shared = self.shared.lock().await;
        shared.in_flight -= 1;
        shared.failed += 1;
        shared.checkpoint.mark_failed(item);
        self.record_outcome(&mut shared).await;
    }

    /// Save on the configured cadence. Runs under the state lock, so saves
    /// land in the same order as the mutations they capture.
    async fn record_outcome(&self, shared: &mut SharedState<A::Record>) {
        shared.unsaved += 1;
        if shared.unsaved < self.settings.checkpoint_interval {
            return;
        }

        shared.checkpoint.touch(Utc::now());
        match self.store.save(&shared.checkpoint).await {
            Ok(()) => {
                shared.unsaved = 0;
                debug!(completed = shared.checkpoint.completed_urls.len(), "Checkpoint saved");
            }
            Err(e) => {
                error!("Failed to save checkpoint: {}", e);
                shared.fatal.get_or_insert(e);
                self.stop.notify_waiters();
            }
        }
    }

    async fn request_pause(&self, reason: PauseReason) {
        let mut shared = self.shared.lock().await;
        if shared.pause.is_none() {
            warn!("Stopping workers: {}", reason);
            shared.pause = Some(reason);
        }
        self.stop.notify_waiters();
    }

    /// A worker could not open its session. A rejected login stops the pool.
    async fn session_failed(&self, login_rejected: bool) {
        let mut shared = self.shared.lock().await;
        shared.open_failures += 1;
        if login_rejected && shared.pause.is_none() {
            warn!("Stopping workers: {}", PauseReason::AuthInvalidated);
            shared.pause = Some(PauseReason::AuthInvalidated);
            self.stop.notify_waiters();
        }
    }

    async fn has_more(&self) -> bool {
        let shared = self.shared.lock().await;
        !shared.queue.is_empty() && shared.pause.is_none() && shared.fatal.is_none()
    }

    /// Jittered wait between items, cut short when the pool is told to stop.
    /// Returns at once when nothing is left to claim.
    async fn pace(&self) {
        // Registered before the state check so a stop signal in between is not lost
        let stopped = self.stop.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        if !self.has_more().await {
            return;
        }

        let delay = self.limiter.next_delay();
        debug!("Waiting {}ms before next item", delay.as_millis());
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stopped => {}
        }
    }
}

async fn run_worker<A: ExtractionAdapter>(id: usize, ctx: Arc<RunContext<A>>) -> WorkerState {
    let mut state = WorkerState::new(id);

    let mut session = match ctx.adapter.open_session(id).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open session: {:#}", e);
            let rejected = e.chain().any(|cause| cause.is::<LoginRejected>());
            ctx.session_failed(rejected).await;
            state.stop();
            return state;
        }
    };
    info!("Worker ready");

    while let Some(item) = ctx.claim().await {
        state.begin(item.clone());
        let timer = ctx.metrics.start_timer();

        let outcome = AssertUnwindSafe(ctx.adapter.extract(&mut session, &item))
            .catch_unwind()
            .await;
        let elapsed_ms = timer.end();

        let failure = match outcome {
            Ok(Ok(Extraction::Record(record))) => {
                state.succeed();
                ctx.metrics.record_item(true, elapsed_ms).await;
                ctx.complete(&item, record).await;
                info!(url = %item, elapsed_ms, "Item completed");
                None
            }
            Ok(Ok(Extraction::AuthInvalidated { url })) => {
                warn!(url = %item, redirected_to = %url, "Authentication rejected");
                state.fail();
                ctx.metrics.record_item(false, elapsed_ms).await;
                ctx.fail(&item).await;
                ctx.request_pause(PauseReason::AuthInvalidated).await;
                break;
            }
            Ok(Ok(Extraction::Empty)) => Some("no data returned".to_string()),
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some("extraction panicked".to_string()),
        };

        if let Some(reason) = failure {
            let streak = state.fail();
            ctx.metrics.record_item(false, elapsed_ms).await;
            ctx.fail(&item).await;
            warn!(url = %item, consecutive_failures = streak, "Item failed: {}", reason);

            if streak >= ctx.settings.failure_threshold {
                let pause = if ctx.adapter.session_valid(&mut session).await {
                    PauseReason::ConsecutiveFailures
                } else {
                    PauseReason::AuthInvalidated
                };
                ctx.request_pause(pause).await;
                break;
            }
        }

        ctx.pace().await;
    }

    state.stop();
    ctx.adapter.close_session(session).await;
    state
}
