use std::fmt;

use serde::{Deserialize, Serialize};

/// A unit of crawl work, identified by its target URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItem {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for WorkItem {
    fn from(url: String) -> Self {
        Self(url)
    }
}

/// What an extraction adapter produced for one work item
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction<R> {
    /// A structured record was extracted (and stored by the adapter)
    Record(R),

    /// The page loaded but nothing usable came out of it
    Empty,

    /// The site redirected to a login, verification or auth-wall page
    AuthInvalidated { url: String },
}

/// Why a crawl stopped before the queue was drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    /// The session ran longer than the configured duration
    SessionTimeout,

    /// The daily quota has been used up
    DailyLimit,

    /// A worker hit the consecutive-failure threshold with a session that still looks valid
    ConsecutiveFailures,

    /// The adapter reported that the login session is no longer accepted
    AuthInvalidated,

    /// The process was asked to stop (Ctrl-C)
    Interrupted,

    /// No worker could open a browser session, so items were left undone
    SessionUnavailable,
}

impl PauseReason {
    /// True when the caller has to log in again before resuming
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, PauseReason::AuthInvalidated)
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PauseReason::SessionTimeout => "session timeout",
            PauseReason::DailyLimit => "daily limit reached",
            PauseReason::ConsecutiveFailures => "too many consecutive failures",
            PauseReason::AuthInvalidated => "re-authentication required",
            PauseReason::Interrupted => "interrupted",
            PauseReason::SessionUnavailable => "no browser session could be opened",
        };
        f.write_str(label)
    }
}

/// Lifecycle of a single worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Fetching,
    Stopped,
}

/// Transient per-worker state. Never persisted.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: usize,
    pub phase: WorkerPhase,
    pub current_item: Option<WorkItem>,
    pub consecutive_failures: u32,
    pub processed: usize,
}

impl WorkerState {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            phase: WorkerPhase::Idle,
            current_item: None,
            consecutive_failures: 0,
            processed: 0,
        }
    }

    pub fn begin(&mut self, item: WorkItem) {
        self.phase = WorkerPhase::Fetching;
        self.current_item = Some(item);
    }

    /// Back to idle after a successful item
    pub fn succeed(&mut self) {
        self.phase = WorkerPhase::Idle;
        self.current_item = None;
        self.consecutive_failures = 0;
        self.processed += 1;
    }

    /// Back to idle after a failed item, returns the new failure streak
    pub fn fail(&mut self) -> u32 {
        self.phase = WorkerPhase::Idle;
        self.current_item = None;
        self.consecutive_failures += 1;
        self.processed += 1;
        self.consecutive_failures
    }

    pub fn stop(&mut self) {
        self.phase = WorkerPhase::Stopped;
        self.current_item = None;
    }
}

/// Outcome of a coordinator run
#[derive(Debug, Clone)]
pub struct CrawlSummary<R> {
    /// Items completed during this run
    pub completed_count: usize,

    /// Items that failed during this run
    pub failed_count: usize,

    /// Items still queued when the run ended
    pub remaining_count: usize,

    /// Set when the run stopped before the queue was drained
    pub paused_reason: Option<PauseReason>,

    /// Records extracted during this run
    pub records: Vec<R>,
}

impl<R> CrawlSummary<R> {
    pub fn needs_reauthentication(&self) -> bool {
        self.paused_reason.map_or(false, |r| r.needs_reauthentication())
    }

    /// True when items are left, whatever stopped the run
    pub fn is_unfinished(&self) -> bool {
        self.paused_reason.is_some() || self.remaining_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_transitions() {
        let mut state = WorkerState::new(0);
        assert_eq!(state.phase, WorkerPhase::Idle);

        state.begin(WorkItem::from("https://example.com/a"));
        assert_eq!(state.phase, WorkerPhase::Fetching);
        assert_eq!(state.fail(), 1);
        state.begin(WorkItem::from("https://example.com/b"));
        assert_eq!(state.fail(), 2);

        state.begin(WorkItem::from("https://example.com/c"));
        state.succeed();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.processed, 3);
        assert!(state.current_item.is_none());

        state.stop();
        assert_eq!(state.phase, WorkerPhase::Stopped);
    }

    #[test]
    fn test_summary_with_items_left_is_unfinished() {
        let mut summary: CrawlSummary<String> = CrawlSummary {
            completed_count: 3,
            failed_count: 0,
            remaining_count: 0,
            paused_reason: None,
            records: Vec::new(),
        };
        assert!(!summary.is_unfinished());

        summary.remaining_count = 2;
        assert!(summary.is_unfinished());

        summary.remaining_count = 0;
        summary.paused_reason = Some(PauseReason::DailyLimit);
        assert!(summary.is_unfinished());
    }

    #[test]
    fn test_pause_reason_serializes_as_constant() {
        let json = serde_json::to_string(&PauseReason::DailyLimit).unwrap();
        assert_eq!(json, "\"DAILY_LIMIT\"");
        assert!(PauseReason::AuthInvalidated.needs_reauthentication());
        assert!(!PauseReason::SessionTimeout.needs_reauthentication());
        assert!(!PauseReason::SessionUnavailable.needs_reauthentication());
        assert_eq!(
            serde_json::to_string(&PauseReason::SessionUnavailable).unwrap(),
            "\"SESSION_UNAVAILABLE\""
        );
    }
}
