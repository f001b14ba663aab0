//! Headless Chromium as the last-resort fetch strategy.
//!
//! One persistent-profile session per run, so cookies earned on one page
//! (consent banners, soft walls) carry over to the next. Navigations are
//! serialized. A session that dies mid-run cannot be recovered without an
//! operator, so it surfaces as [`BrowserError::Closed`] and ends the run.

use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{BrowserConfig, CooldownConfig};
use crate::cooldown::CooldownTracker;
use crate::error::BrowserError;
use crate::extract::TextExtractor;
use crate::fetchers::mirrors::{ARCHIVE_COOLDOWN_KEY, archive_url};
use crate::fetchers::{page_attempt, worse};
use crate::models::{FetchAttempt, Method};
use crate::utils::truncate_for_log;

pub trait BrowserSession {
    /// Navigate to `url` and return the rendered DOM.
    async fn render(&self, url: &str) -> Result<String, BrowserError>;

    async fn close(&self);
}

/// Chromium driven through `--dump-dom` against a persistent profile.
#[derive(Debug)]
pub struct ChromeSession {
    bin: String,
    profile_dir: PathBuf,
    nav_timeout: Duration,
    /// Held for the length of a navigation; `true` once the profile exists.
    ready: Mutex<bool>,
    closed: AtomicBool,
}

impl ChromeSession {
    pub fn new(config: &BrowserConfig) -> Self {
        let bin = config
            .chrome_bin
            .clone()
            .or_else(|| std::env::var("CHROME_BIN").ok())
            .unwrap_or_else(|| "chromium".to_string());
        Self {
            bin,
            profile_dir: config.profile_dir.clone(),
            nav_timeout: config.nav_timeout(),
            ready: Mutex::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

impl BrowserSession for ChromeSession {
    #[instrument(level = "info", skip(self))]
    async fn render(&self, url: &str) -> Result<String, BrowserError> {
        let mut ready = self.ready.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::Closed("session was closed".into()));
        }
        if !*ready {
            tokio::fs::create_dir_all(&self.profile_dir)
                .await
                .map_err(|e| BrowserError::Failed(format!("creating profile dir: {e}")))?;
            info!(bin = %self.bin, profile = %self.profile_dir.display(), "Browser session started");
            *ready = true;
        }

        let profile_arg = format!("--user-data-dir={}", self.profile_dir.display());
        let timeout_arg = format!("--timeout={}", self.nav_timeout.as_millis());
        let mut cmd = Command::new(&self.bin);
        cmd.args([
            "--headless=new",
            "--no-sandbox",
            "--disable-gpu",
            "--disable-dev-shm-usage",
            "--no-first-run",
            profile_arg.as_str(),
            timeout_arg.as_str(),
            "--dump-dom",
            url,
        ])
        .kill_on_drop(true);

        let limit = self.nav_timeout + Duration::from_secs(5);
        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Err(_) => return Err(BrowserError::Timeout),
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(BrowserError::Closed(format!("{} not found", self.bin)));
            }
            Ok(Err(e)) => return Err(BrowserError::Failed(e.to_string())),
            Ok(Ok(output)) => output,
        };

        if let Some(signal) = output.status.signal() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(BrowserError::Closed(format!("browser killed by signal {signal}")));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BrowserError::Failed(truncate_for_log(&stderr, 300)));
        }

        let html = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(bytes = html.len(), "Rendered page");
        Ok(html)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Browser session closed");
        }
    }
}

/// archive.today answers a miss with a page like this instead of a 404.
fn is_archive_miss(html: &str) -> bool {
    html.contains("No results") || html.contains("List of URLs, ordered from newer to older")
}

#[derive(Debug)]
pub struct BrowserAcquirer<B> {
    session: B,
    extractor: TextExtractor,
    cooldowns: Arc<CooldownTracker>,
    cooldown: CooldownConfig,
    mirror: Option<String>,
    archive_first: bool,
}

impl<B: BrowserSession> BrowserAcquirer<B> {
    pub fn new(
        session: B,
        extractor: TextExtractor,
        cooldowns: Arc<CooldownTracker>,
        cooldown: CooldownConfig,
        mirror: Option<String>,
        archive_first: bool,
    ) -> Self {
        Self {
            session,
            extractor,
            cooldowns,
            cooldown,
            mirror,
            archive_first,
        }
    }

    pub fn session(&self) -> &B {
        &self.session
    }

    /// Render the archive page, then the original. Only a closed session is
    /// an error; every other problem is folded into the attempt.
    #[instrument(level = "info", skip(self))]
    pub async fn acquire(&self, url: &str) -> Result<FetchAttempt, BrowserError> {
        let mut signal = FetchAttempt::NoText;
        let mut best_short = None;

        if let (true, Some(mirror)) = (self.archive_first, self.mirror.as_deref()) {
            if self.cooldowns.is_in_cooldown(ARCHIVE_COOLDOWN_KEY).is_some() {
                debug!("Archive cooling down; skipping archive render");
            } else {
                let target = archive_url(mirror, url);
                match self.render(&target, Method::BrowserArchive).await? {
                    FetchAttempt::Success(page) => return Ok(FetchAttempt::Success(page)),
                    FetchAttempt::Short(page) => best_short = Some(page),
                    other => signal = worse(signal, other),
                }
            }
        }

        if let Some(hit) = self.cooldowns.is_cooling(url) {
            info!(host = %hit.host, reason = %hit.reason, "Original host cooling down; not rendering");
            return Ok(best_short.map(FetchAttempt::Short).unwrap_or(signal));
        }

        match self.render(url, Method::Browser).await? {
            FetchAttempt::Success(page) => Ok(FetchAttempt::Success(page)),
            FetchAttempt::Short(page) => {
                let best = match best_short {
                    Some(prev) if prev.text.len() >= page.text.len() => prev,
                    _ => page,
                };
                Ok(FetchAttempt::Short(best))
            }
            other => Ok(best_short.map(FetchAttempt::Short).unwrap_or(worse(signal, other))),
        }
    }

    async fn render(&self, target: &str, method: Method) -> Result<FetchAttempt, BrowserError> {
        let attempt = match self.session.render(target).await {
            Ok(html) if method == Method::BrowserArchive && is_archive_miss(&html) => {
                debug!(target_url = target, "Archive has no snapshot");
                FetchAttempt::NoText
            }
            Ok(html) => page_attempt(&self.extractor, html, method),
            Err(BrowserError::Timeout) => {
                self.cooldowns.set_cooldown(target, self.cooldown.timeout(), "browser timeout");
                FetchAttempt::Timeout
            }
            Err(BrowserError::Failed(e)) => {
                warn!(target_url = target, error = %e, "Browser navigation failed");
                FetchAttempt::NoText
            }
            Err(closed @ BrowserError::Closed(_)) => return Err(closed),
        };
        if attempt == FetchAttempt::Captcha {
            self.cooldowns.set_cooldown(target, self.cooldown.captcha(), "captcha (browser)");
        }
        info!(target_url = target, %method, outcome = attempt.label(), "Browser render finished");
        Ok(attempt)
    }
}
