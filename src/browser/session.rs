use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thirtyfour::prelude::*;
use thirtyfour::Cookie;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::browser::behavior::BehaviorSimulator;
use crate::cli::config::BrowserSettings;

/// Browser cookie in the shape kept in the auth-state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
}

/// One WebDriver-controlled browser
pub struct BrowserSession {
    config: BrowserSettings,
    behavior: BehaviorSimulator,
    driver: Option<WebDriver>,
}

impl BrowserSession {
    pub fn new(config: BrowserSettings) -> Self {
        let behavior = BehaviorSimulator::new(config.behavior.clone());
        Self {
            config,
            behavior,
            driver: None,
        }
    }

    /// Create a session and connect it right away
    pub async fn connect(config: BrowserSettings) -> Result<Self> {
        let mut session = Self::new(config);
        session.initialize().await?;
        Ok(session)
    }

    pub async fn initialize(&mut self) -> Result<()> {
        self.close().await?;

        let mut caps = DesiredCapabilities::chrome();
        caps.add_chrome_arg(&format!("--user-agent={}", self.config.user_agent))?;
        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            self.config.viewport.width, self.config.viewport.height
        ))?;
        if self.config.headless {
            caps.set_headless()?;
        }
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--no-sandbox")?;
        caps.add_chrome_option("excludeSwitches", serde_json::json!(["enable-automation"]))?;

        let driver = WebDriver::new(&self.config.webdriver_url, caps)
            .await
            .with_context(|| format!("Failed to connect to WebDriver at {}", self.config.webdriver_url))?;
        driver
            .set_page_load_timeout(Duration::from_secs(self.config.page_load_timeout_secs))
            .await?;

        debug!("Browser session initialized");
        self.driver = Some(driver);
        Ok(())
    }

    pub fn is_headless(&self) -> bool {
        self.config.headless
    }

    pub fn behavior(&self) -> &BehaviorSimulator {
        &self.behavior
    }

    fn driver(&self) -> Result<&WebDriver> {
        self.driver.as_ref().context("Browser session not initialized")
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        debug!("Navigating to: {}", url);
        self.driver()?
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to URL: {}", url))?;
        Ok(())
    }

    /// Wait for the page to settle after navigation
    pub async fn settle(&self) {
        sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
    }

    /// URL after any redirects
    pub async fn current_url(&self) -> Result<String> {
        let url = self.driver()?.current_url().await.context("Failed to read current URL")?;
        Ok(url.to_string())
    }

    pub async fn page_source(&self) -> Result<String> {
        let source = self.driver()?.source().await.context("Failed to get page source")?;
        Ok(source)
    }

    pub async fn scroll(&self) -> Result<()> {
        self.behavior.scroll(self.driver()?).await
    }

    pub async fn wait_for_element(&self, selector: &str, timeout_secs: u64) -> Result<WebElement> {
        let element = self
            .driver()?
            .query(By::Css(selector))
            .wait(Duration::from_secs(timeout_secs), Duration::from_millis(250))
            .first()
            .await
            .with_context(|| format!("Element not found: {}", selector))?;
        Ok(element)
    }

    /// Type into the first element matching `selector`
    pub async fn fill(&self, selector: &str, text: &str, timeout_secs: u64) -> Result<()> {
        let element = self.wait_for_element(selector, timeout_secs).await?;
        self.behavior.type_text(&element, text).await
    }

    pub async fn click(&self, selector: &str, timeout_secs: u64) -> Result<()> {
        let element = self.wait_for_element(selector, timeout_secs).await?;
        self.behavior.click(&element).await
    }

    pub async fn export_cookies(&self) -> Result<Vec<StoredCookie>> {
        let cookies = self.driver()?.get_all_cookies().await.context("Failed to read cookies")?;
        Ok(cookies
            .iter()
            .map(|c| StoredCookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain: c.domain().map(str::to_string),
                path: c.path().map(str::to_string),
                secure: c.secure(),
            })
            .collect())
    }

    /// Add cookies to the current origin; the browser must already be on it
    pub async fn import_cookies(&self, cookies: &[StoredCookie]) -> Result<()> {
        let driver = self.driver()?;
        for stored in cookies {
            let mut cookie = Cookie::new(stored.name.clone(), stored.value.clone());
            if let Some(domain) = &stored.domain {
                cookie.set_domain(domain.clone());
            }
            if let Some(path) = &stored.path {
                cookie.set_path(path.clone());
            }
            if let Some(secure) = stored.secure {
                cookie.set_secure(secure);
            }
            if let Err(e) = driver.add_cookie(cookie).await {
                debug!("Skipping cookie {}: {}", stored.name, e);
            }
        }
        debug!("Restored {} cookies", cookies.len());
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}
