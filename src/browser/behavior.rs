use anyhow::Result;
use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use thirtyfour::prelude::*;
use tracing::debug;

use crate::cli::config::BrowserBehavior;

/// Uniform sample from an inclusive `(min, max)` millisecond range
pub fn sample_ms(range: (u64, u64)) -> u64 {
    let (min, max) = (range.0.min(range.1), range.0.max(range.1));
    if min == max {
        return min;
    }
    thread_rng().gen_range(min..=max)
}

/// Human-like input for page interaction
#[derive(Debug, Clone)]
pub struct BehaviorSimulator {
    config: BrowserBehavior,
}

impl BehaviorSimulator {
    pub fn new(config: BrowserBehavior) -> Self {
        Self { config }
    }

    /// Scroll down one viewport at a time so lazy sections render
    pub async fn scroll(&self, driver: &WebDriver) -> Result<()> {
        for _ in 0..self.config.scroll_steps {
            driver
                .execute("window.scrollBy(0, window.innerHeight);", Vec::new())
                .await?;
            sleep(Duration::from_millis(sample_ms(self.config.scroll_pause))).await;
        }

        debug!("Scrolled {} viewports", self.config.scroll_steps);
        Ok(())
    }

    /// Click after a short reaction delay
    pub async fn click(&self, element: &WebElement) -> Result<()> {
        sleep(Duration::from_millis(sample_ms(self.config.click_delay))).await;
        element.scroll_into_view().await?;
        element.click().await?;

        debug!("Clicked element");
        Ok(())
    }

    /// Type one character at a time with a variable delay
    pub async fn type_text(&self, element: &WebElement, text: &str) -> Result<()> {
        element.clear().await?;

        for c in text.chars() {
            element.send_keys(c.to_string()).await?;
            sleep(Duration::from_millis(sample_ms(self.config.typing_speed))).await;
        }

        debug!("Typed {} characters", text.chars().count());
        Ok(())
    }

    /// Short pause between interactions
    pub async fn pause(&self) {
        sleep(Duration::from_millis(sample_ms(self.config.scroll_pause))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_in_range() {
        for _ in 0..500 {
            let value = sample_ms((50, 150));
            assert!((50..=150).contains(&value));
        }
    }

    #[test]
    fn test_sample_handles_reversed_and_fixed_ranges() {
        assert_eq!(sample_ms((200, 200)), 200);
        let value = sample_ms((300, 100));
        assert!((100..=300).contains(&value));
    }
}
