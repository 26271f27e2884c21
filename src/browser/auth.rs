use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::session::{BrowserSession, StoredCookie};
use crate::cli::config::AuthSettings;
use crate::crawler::coordinator::LoginRejected;
use crate::storage::atomic::write_atomic_async;

/// Login credentials, read from the environment
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env(settings: &AuthSettings) -> Result<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("Environment variable {} is not set", name))
        };
        Ok(Self {
            email: read(&settings.email_env)?,
            password: read(&settings.password_env)?,
        })
    }
}

/// Saved browser login, shared by all workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub cookies: Vec<StoredCookie>,
    pub saved_at: DateTime<Utc>,
}

impl AuthState {
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let state = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse auth state: {}", path.display()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read auth state: {}", path.display())),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic_async(path.to_path_buf(), json)
            .await
            .with_context(|| format!("Failed to write auth state: {}", path.display()))
    }

    /// Remove the file, returns whether there was one
    pub async fn delete(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete auth state: {}", path.display())),
        }
    }
}

/// True when `url`'s path contains one of `markers`
pub fn matches_marker(url: &str, markers: &[String]) -> bool {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    markers.iter().any(|marker| path.contains(marker.as_str()))
}

/// Logs browser sessions in and keeps the saved login current
pub struct Authenticator {
    settings: AuthSettings,
    state_path: PathBuf,
}

impl Authenticator {
    pub fn new(settings: AuthSettings, state_path: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            state_path: state_path.into(),
        }
    }

    pub fn is_blocked_url(&self, url: &str) -> bool {
        matches_marker(url, &self.settings.blocked_markers)
    }

    fn is_challenge_url(&self, url: &str) -> bool {
        matches_marker(url, &self.settings.challenge_markers)
    }

    /// Make `session` logged in, reusing the saved login when it still works
    pub async fn ensure_login(&self, session: &BrowserSession) -> Result<()> {
        if self.restore(session).await? {
            return Ok(());
        }

        let credentials = Credentials::from_env(&self.settings)?;
        self.login(session, &credentials).await
    }

    /// Load saved cookies into the session; false when there are none or they are stale
    pub async fn restore(&self, session: &BrowserSession) -> Result<bool> {
        let state = match AuthState::load(&self.state_path).await? {
            Some(state) => state,
            None => return Ok(false),
        };

        // Cookies can only be set for the origin currently loaded
        session.navigate(&self.settings.login_url).await?;
        session.import_cookies(&state.cookies).await?;

        if self.validate(session).await? {
            info!(saved_at = %state.saved_at, "Reusing saved login");
            Ok(true)
        } else {
            warn!("Saved login is no longer valid");
            self.invalidate().await?;
            Ok(false)
        }
    }

    /// Whether the session still reaches a members-only page
    pub async fn validate(&self, session: &BrowserSession) -> Result<bool> {
        session.navigate(&self.settings.validation_url).await?;
        session.settle().await;
        let url = session.current_url().await?;
        debug!(url = %url, "Checked login");
        Ok(!self.is_blocked_url(&url))
    }

    pub async fn login(&self, session: &BrowserSession, credentials: &Credentials) -> Result<()> {
        info!("Logging in as {}", credentials.email);
        session.navigate(&self.settings.login_url).await?;
        session.settle().await;

        let wait = self.settings.login_wait_secs;
        session.fill(&self.settings.username_selector, &credentials.email, wait).await?;
        session.behavior().pause().await;
        session.fill(&self.settings.password_selector, &credentials.password, wait).await?;
        session.behavior().pause().await;
        session.click(&self.settings.submit_selector, wait).await?;

        sleep(Duration::from_secs(wait)).await;
        let mut url = session.current_url().await?;

        if self.is_challenge_url(&url) {
            url = self.wait_for_challenge(session).await?;
        }

        if self.is_blocked_url(&url) {
            return Err(LoginRejected { url }.into());
        }

        let state = AuthState {
            cookies: session.export_cookies().await?,
            saved_at: Utc::now(),
        };
        state.save(&self.state_path).await?;
        info!(cookies = state.cookies.len(), "Login succeeded, saved auth state");
        Ok(())
    }

    /// Leave a headed browser open so the verification can be solved by hand
    async fn wait_for_challenge(&self, session: &BrowserSession) -> Result<String> {
        if session.is_headless() {
            bail!("Login requires a verification step; rerun with a visible browser to solve it");
        }

        warn!(
            "Verification required, solve it in the browser window within {} seconds",
            self.settings.manual_challenge_secs
        );
        let deadline = Instant::now() + Duration::from_secs(self.settings.manual_challenge_secs);
        loop {
            sleep(Duration::from_secs(2)).await;
            let url = session.current_url().await?;
            if !self.is_challenge_url(&url) {
                return Ok(url);
            }
            if Instant::now() >= deadline {
                bail!("Verification was not completed in time");
            }
        }
    }

    /// Forget the saved login
    pub async fn invalidate(&self) -> Result<()> {
        if AuthState::delete(&self.state_path).await? {
            info!("Deleted stale auth state {}", self.state_path.display());
        }
        Ok(())
    }
}
