use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Per-run throughput counters, shared between workers
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub start_time: DateTime<Utc>,

    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,

    /// Sum of extraction times, in milliseconds
    pub total_duration_ms: u64,
    pub slowest_item_ms: u64,

    /// Items finished per wall-clock minute
    pub crawl_rate: Vec<(DateTime<Utc>, usize)>,

    /// Highest per-minute count seen so far
    pub peak_rate: usize,
}

impl Metrics {
    pub fn average_duration_ms(&self) -> u64 {
        if self.total_items == 0 {
            0
        } else {
            self.total_duration_ms / self.total_items as u64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.successful_items as f64 / self.total_items as f64
        }
    }

    pub fn items_per_minute(&self) -> f64 {
        let elapsed = (Utc::now() - self.start_time).num_seconds().max(1) as f64;
        self.total_items as f64 * 60.0 / elapsed
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record the outcome of one extraction
    pub async fn record_item(&self, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_items += 1;
        if success {
            metrics.successful_items += 1;
        } else {
            metrics.failed_items += 1;
        }

        metrics.total_duration_ms += duration_ms;
        metrics.slowest_item_ms = metrics.slowest_item_ms.max(duration_ms);

        let now = Utc::now();
        let same_minute = metrics
            .crawl_rate
            .last()
            .map_or(false, |(last_time, _)| (now - *last_time).num_seconds() < 60);
        if same_minute {
            if let Some((_, count)) = metrics.crawl_rate.last_mut() {
                *count += 1;
            }
        } else {
            metrics.crawl_rate.push((now, 1));
        }

        let minute_count = metrics.crawl_rate.last().map_or(0, |(_, count)| *count);
        metrics.peak_rate = metrics.peak_rate.max(minute_count);
    }

    pub fn start_timer(&self) -> ItemTimer {
        ItemTimer {
            start: Instant::now(),
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

/// Measures one extraction
pub struct ItemTimer {
    start: Instant,
}

impl ItemTimer {
    /// Elapsed time in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_item() {
        let collector = MetricsCollector::new();
        collector.record_item(true, 100).await;
        collector.record_item(true, 300).await;
        collector.record_item(false, 50).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_items, 3);
        assert_eq!(metrics.successful_items, 2);
        assert_eq!(metrics.failed_items, 1);
        assert_eq!(metrics.average_duration_ms(), 150);
        assert_eq!(metrics.slowest_item_ms, 300);
        assert_eq!(metrics.peak_rate, 3);
        assert!((metrics.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = Metrics::default();
        assert_eq!(metrics.average_duration_ms(), 0);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_uses_tokio_clock() {
        let collector = MetricsCollector::new();
        let timer = collector.start_timer();
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let elapsed = timer.end();
        assert!((250..260).contains(&elapsed), "elapsed {}", elapsed);
    }
}
