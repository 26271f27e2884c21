use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::crawler::filter::UrlFilter;
use crate::crawler::task::WorkItem;
use crate::storage::atomic::write_atomic_async;

/// Accepted target file shapes
#[derive(Deserialize)]
#[serde(untagged)]
enum TargetFile {
    List(Vec<String>),
    Wrapped { urls: Vec<String> },
}

/// Parse target URLs from a JSON array, a JSON object with a `urls` array,
/// or plain text with one URL per line (`#` starts a comment).
pub fn parse_targets(content: &str) -> Result<Vec<String>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        let parsed: TargetFile = serde_json::from_str(content).context("Invalid target list JSON")?;
        return Ok(match parsed {
            TargetFile::List(urls) | TargetFile::Wrapped { urls } => urls,
        });
    }

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Normalize, filter and de-duplicate raw URLs, keeping their order
pub fn prepare_targets(raw: &[String], filter: &mut UrlFilter, limit: Option<usize>) -> Vec<WorkItem> {
    let mut items = Vec::new();
    let mut rejected = 0;

    for url in raw {
        if limit.map_or(false, |limit| items.len() >= limit) {
            break;
        }
        match filter.accept(url) {
            Some(normalized) => items.push(WorkItem::new(normalized)),
            None => rejected += 1,
        }
    }

    if rejected > 0 {
        warn!("Skipped {} invalid, filtered or duplicate target URLs", rejected);
    }
    items
}

pub async fn load_targets(path: &Path, filter: &mut UrlFilter, limit: Option<usize>) -> Result<Vec<WorkItem>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read target list {}", path.display()))?;
    let raw = parse_targets(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    let items = prepare_targets(&raw, filter, limit);

    info!("Loaded {} targets from {}", items.len(), path.display());
    Ok(items)
}

/// Write targets as a JSON array, replacing the file atomically
pub async fn save_targets(path: &Path, items: &[WorkItem]) -> Result<()> {
    let json = serde_json::to_vec_pretty(items)?;
    write_atomic_async(path.to_path_buf(), json)
        .await
        .with_context(|| format!("Failed to write target list {}", path.display()))?;
    info!("Saved {} targets to {}", items.len(), path.display());
    Ok(())
}
