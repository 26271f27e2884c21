use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::crawler::task::WorkItem;
use crate::storage::atomic::write_atomic_async;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted crawl progress.
///
/// `completed` and `failed` never overlap. Items are only ever added to
/// `target_urls`; a failed item that later succeeds moves to `completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default)]
    pub completed_urls: BTreeSet<WorkItem>,

    #[serde(default)]
    pub failed_urls: BTreeSet<WorkItem>,

    /// Every item discovered so far, in discovery order
    #[serde(default)]
    pub target_urls: Vec<WorkItem>,

    #[serde(default)]
    pub total_urls: usize,

    #[serde(default)]
    pub scraped_count: usize,

    /// Time of the last save; also the reference day for `daily_count`
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_count: Option<u32>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    pub fn new() -> Self {
        Self {
            completed_urls: BTreeSet::new(),
            failed_urls: BTreeSet::new(),
            target_urls: Vec::new(),
            total_urls: 0,
            scraped_count: 0,
            timestamp: Utc::now(),
            daily_count: None,
        }
    }

    /// Append newly discovered items to the target list, returns how many were new
    pub fn merge_targets(&mut self, fresh: &[WorkItem]) -> usize {
        let mut known: HashSet<WorkItem> = self.target_urls.iter().cloned().collect();

        // Files written before targets were recorded only list outcomes
        let backfill: Vec<WorkItem> = self
            .completed_urls
            .iter()
            .chain(self.failed_urls.iter())
            .filter(|item| !known.contains(*item))
            .cloned()
            .collect();
        for item in backfill {
            known.insert(item.clone());
            self.target_urls.push(item);
        }

        let mut added = 0;
        for item in fresh {
            if known.insert(item.clone()) {
                self.target_urls.push(item.clone());
                added += 1;
            }
        }

        self.total_urls = self.target_urls.len();
        added
    }

    /// Record a completed item, returns false if it was already completed
    pub fn mark_completed(&mut self, item: &WorkItem) -> bool {
        self.failed_urls.remove(item);
        let inserted = self.completed_urls.insert(item.clone());
        if inserted {
            self.daily_count = Some(self.daily_count() + 1);
        }
        self.scraped_count = self.completed_urls.len();
        inserted
    }

    /// Record a failed item. Completed items are never demoted.
    pub fn mark_failed(&mut self, item: &WorkItem) {
        if !self.completed_urls.contains(item) {
            self.failed_urls.insert(item.clone());
        }
    }

    pub fn is_completed(&self, item: &WorkItem) -> bool {
        self.completed_urls.contains(item)
    }

    pub fn daily_count(&self) -> u32 {
        self.daily_count.unwrap_or(0)
    }

    /// Reset the daily counter when `now` falls on a different calendar day
    /// than the last save, as seen in `now`'s time zone. Returns true on reset.
    pub fn roll_day<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> bool {
        let last_day = self.timestamp.with_timezone(&now.timezone()).date_naive();
        if last_day == now.date_naive() {
            return false;
        }

        debug!(previous = self.daily_count(), "New day, resetting daily count");
        self.daily_count = Some(0);
        self.timestamp = now.with_timezone(&Utc);
        true
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.timestamp = now;
    }
}

/// Items of `fresh` that still need work, in their original order.
///
/// Completed items are dropped and duplicates collapse onto their first
/// occurrence. Pure, so calling it twice with the same inputs gives the same queue.
pub fn reconcile(existing: &Checkpoint, fresh: &[WorkItem]) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    fresh
        .iter()
        .filter(|item| !existing.is_completed(item))
        .filter(|item| seen.insert(*item))
        .cloned()
        .collect()
}

/// Durable storage for a [`Checkpoint`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last saved state, or an empty checkpoint when nothing was saved yet
    async fn load(&self) -> Result<Checkpoint, CheckpointError>;

    /// Replace the saved state atomically
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Forget all progress
    async fn clear(&self) -> Result<(), CheckpointError>;
}

/// Checkpoint kept as a pretty-printed JSON file
pub struct JsonCheckpointStore {
    path: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No checkpoint at {}, starting fresh", self.path.display());
                return Ok(Checkpoint::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let checkpoint: Checkpoint =
            serde_json::from_str(&contents).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        info!(
            completed = checkpoint.completed_urls.len(),
            failed = checkpoint.failed_urls.len(),
            "Checkpoint loaded, resuming from previous session"
        );
        Ok(checkpoint)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic_async(self.path.clone(), bytes)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!(
            completed = checkpoint.completed_urls.len(),
            "Checkpoint saved to {}",
            self.path.display()
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
