use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::crawler::task::PauseReason;

/// Pacing and quota settings, fixed for the duration of a run
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Maximum completed items per calendar day
    #[serde(default)]
    pub daily_limit: Option<u32>,

    /// Stop dispatching once a run has lasted this long
    #[serde(default)]
    pub session_duration_ms: Option<u64>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 3000,
            max_delay_ms: 7000,
            daily_limit: None,
            session_duration_ms: None,
        }
    }
}

/// Decides how long to wait between items and when to stop a run
#[derive(Debug, Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self { policy }
    }

    /// Jittered pause, uniform over `[min_delay_ms, max_delay_ms]`.
    ///
    /// Every call draws from the calling thread's generator, so workers never
    /// share a sequence.
    pub fn next_delay(&self) -> Duration {
        let min = self.policy.min_delay_ms.min(self.policy.max_delay_ms);
        let max = self.policy.max_delay_ms.max(self.policy.min_delay_ms);
        if min == max {
            return Duration::from_millis(min);
        }
        Duration::from_millis(thread_rng().gen_range(min..=max))
    }

    /// Whether the crawl should stop before dispatching another item
    pub fn should_pause(
        &self,
        session_start: Instant,
        now: Instant,
        completed_today: u32,
    ) -> Option<PauseReason> {
        if let Some(limit) = self.policy.session_duration_ms {
            let elapsed = now.saturating_duration_since(session_start);
            if elapsed > Duration::from_millis(limit) {
                return Some(PauseReason::SessionTimeout);
            }
        }

        if let Some(limit) = self.policy.daily_limit {
            if completed_today >= limit {
                return Some(PauseReason::DailyLimit);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(daily_limit: Option<u32>, session_duration_ms: Option<u64>) -> RateLimiter {
        RateLimiter::new(RateLimitPolicy {
            min_delay_ms: 100,
            max_delay_ms: 200,
            daily_limit,
            session_duration_ms,
        })
    }

    #[test]
    fn test_delay_stays_in_range() {
        let limiter = limiter(None, None);
        for _ in 0..1000 {
            let delay = limiter.next_delay().as_millis();
            assert!((100..=200).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_delay_is_resampled() {
        let limiter = limiter(None, None);
        let samples: std::collections::HashSet<u128> =
            (0..200).map(|_| limiter.next_delay().as_millis()).collect();
        assert!(samples.len() > 1);
    }

    #[test]
    fn test_fixed_delay() {
        let limiter = RateLimiter::new(RateLimitPolicy {
            min_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        });
        assert_eq!(limiter.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_no_limits_never_pauses() {
        let limiter = limiter(None, None);
        let start = Instant::now();
        assert_eq!(
            limiter.should_pause(start, start + Duration::from_secs(86_400), u32::MAX),
            None
        );
    }

    #[test]
    fn test_session_timeout() {
        let limiter = limiter(None, Some(1000));
        let start = Instant::now();

        assert_eq!(limiter.should_pause(start, start + Duration::from_millis(1000), 0), None);
        assert_eq!(
            limiter.should_pause(start, start + Duration::from_millis(1001), 0),
            Some(PauseReason::SessionTimeout)
        );
    }

    #[test]
    fn test_daily_limit() {
        let limiter = limiter(Some(100), None);
        let start = Instant::now();

        assert_eq!(limiter.should_pause(start, start, 99), None);
        assert_eq!(limiter.should_pause(start, start, 100), Some(PauseReason::DailyLimit));
    }
}
