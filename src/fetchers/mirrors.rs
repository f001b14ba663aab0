//! Ordered fetch strategies for a single article URL.
//!
//! 1. direct GET (skipped while the host cools down)
//! 2. text-rendering proxy
//! 3. archive mirrors, `https://{mirror}/newest/{url}`
//! 4. web-archive availability lookup, snapshot, snapshot via proxy
//!
//! Block signals set cooldowns as they are seen. A 429 on the direct request
//! aborts the chain; a 429 from any archive mirror pauses every mirror.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{CooldownConfig, FetchConfig};
use crate::cooldown::CooldownTracker;
use crate::error::HttpError;
use crate::extract::TextExtractor;
use crate::fetchers::http::{HttpGet, HttpResponse};
use crate::fetchers::{page_attempt, worse};
use crate::models::{FetchAttempt, FetchedPage, Method};
use crate::utils::truncate_for_log;

/// Cooldown key shared by all archive.today mirrors.
pub const ARCHIVE_COOLDOWN_KEY: &str = "archive.today";

pub fn archive_url(mirror: &str, url: &str) -> String {
    format!("https://{mirror}/newest/{url}")
}

#[derive(Debug, Deserialize)]
struct WaybackAvailability {
    #[serde(default)]
    archived_snapshots: WaybackSnapshots,
}

#[derive(Debug, Default, Deserialize)]
struct WaybackSnapshots {
    closest: Option<WaybackSnapshot>,
}

#[derive(Debug, Deserialize)]
struct WaybackSnapshot {
    #[serde(default)]
    available: bool,
    url: String,
}

#[derive(Debug, Clone)]
pub struct MirrorChain<H> {
    http: H,
    extractor: TextExtractor,
    cooldowns: Arc<CooldownTracker>,
    fetch: FetchConfig,
    cooldown: CooldownConfig,
}

/// Running state of one pass over the chain.
struct Pass {
    best_short: Option<FetchedPage>,
    signal: FetchAttempt,
}

impl Pass {
    /// Fold a strategy's result in. Returns the attempt when it ends the pass.
    fn absorb(&mut self, attempt: FetchAttempt) -> Option<FetchAttempt> {
        match attempt {
            FetchAttempt::Success(_) => Some(attempt),
            FetchAttempt::Short(page) => {
                let longer = self
                    .best_short
                    .as_ref()
                    .is_none_or(|best| page.text.chars().count() > best.text.chars().count());
                if longer {
                    self.best_short = Some(page);
                }
                None
            }
            other => {
                self.signal = worse(std::mem::replace(&mut self.signal, FetchAttempt::NoText), other);
                None
            }
        }
    }

    fn finish(self) -> FetchAttempt {
        match self.best_short {
            Some(page) => FetchAttempt::Short(page),
            None => self.signal,
        }
    }
}

impl<H: HttpGet> MirrorChain<H> {
    pub fn new(
        http: H,
        extractor: TextExtractor,
        cooldowns: Arc<CooldownTracker>,
        fetch: FetchConfig,
        cooldown: CooldownConfig,
    ) -> Self {
        Self {
            http,
            extractor,
            cooldowns,
            fetch,
            cooldown,
        }
    }

    /// One pass over every strategy for `url`.
    #[instrument(level = "info", skip(self))]
    pub async fn fetch_once(&self, url: &str) -> FetchAttempt {
        let mut pass = Pass {
            best_short: None,
            signal: FetchAttempt::NoText,
        };

        match self.attempt(url, url, Method::Fetch).await {
            Some(FetchAttempt::Blocked { status: 429 }) => {
                warn!(url, "Rate limited on direct fetch; aborting chain");
                return FetchAttempt::Blocked { status: 429 };
            }
            Some(a) => {
                if let Some(done) = pass.absorb(a) {
                    return done;
                }
            }
            None => debug!(url, "Direct fetch skipped; host cooling down"),
        }

        if let Some(prefix) = self.fetch.proxy_prefix.as_deref() {
            let proxied = format!("{prefix}{url}");
            if let Some(a) = self.attempt(&proxied, url, Method::Proxy).await {
                if let Some(done) = pass.absorb(a) {
                    return done;
                }
            }
        }

        if let Some(done) = self.try_mirrors(url, &mut pass).await {
            return done;
        }

        if self.fetch.wayback {
            if let Some(done) = self.try_wayback(url, &mut pass).await {
                return done;
            }
        }

        let result = pass.finish();
        info!(url, outcome = result.label(), "Mirror chain exhausted");
        result
    }

    async fn try_mirrors(&self, url: &str, pass: &mut Pass) -> Option<FetchAttempt> {
        if let Some(hit) = self.cooldowns.is_in_cooldown(ARCHIVE_COOLDOWN_KEY) {
            debug!(remaining_secs = hit.remaining.as_secs(), "Archive mirrors cooling down");
            return None;
        }
        for mirror in &self.fetch.archive_mirrors {
            let target = archive_url(mirror, url);
            let Some(a) = self.attempt(&target, url, Method::Archive).await else {
                continue;
            };
            if let FetchAttempt::Blocked { status: 429 } = a {
                self.cooldowns.set_cooldown(
                    ARCHIVE_COOLDOWN_KEY,
                    self.cooldown.archive_rate_limited(),
                    &format!("429 from {mirror}"),
                );
                pass.absorb(a);
                return None;
            }
            if let Some(done) = pass.absorb(a) {
                return Some(done);
            }
        }
        None
    }

    async fn try_wayback(&self, url: &str, pass: &mut Pass) -> Option<FetchAttempt> {
        let lookup = format!("{}?url={}", self.fetch.wayback_api, urlencoding::encode(url));
        let snapshot = match self.request(&lookup, Method::Wayback).await? {
            Ok(resp) => match serde_json::from_str::<WaybackAvailability>(&resp.body) {
                Ok(v) => v.archived_snapshots.closest.filter(|s| s.available).map(|s| s.url),
                Err(e) => {
                    warn!(error = %e, body = %truncate_for_log(&resp.body, 200), "Unparseable wayback availability");
                    None
                }
            },
            Err(signal) => {
                debug!(outcome = signal.label(), "Wayback availability lookup failed");
                None
            }
        };
        let snapshot = snapshot?;

        let a = self.attempt(&snapshot, url, Method::Wayback).await?;
        if let Some(done) = pass.absorb(a) {
            return Some(done);
        }
        if let Some(prefix) = self.fetch.proxy_prefix.as_deref() {
            let proxied = format!("{prefix}{snapshot}");
            let a = self.attempt(&proxied, url, Method::WaybackProxy).await?;
            return pass.absorb(a);
        }
        None
    }

    /// GET `fetch_url` and classify it. Cooldowns land on `fetch_url`'s host.
    /// `None` when that host is cooling down.
    async fn attempt(&self, fetch_url: &str, article: &str, method: Method) -> Option<FetchAttempt> {
        let attempt = match self.request(fetch_url, method).await? {
            Ok(resp) => page_attempt(&self.extractor, resp.body, method),
            Err(signal) => signal,
        };
        if attempt == FetchAttempt::Captcha {
            self.cooldowns.set_cooldown(fetch_url, self.cooldown.captcha(), "captcha");
        }
        info!(article, %method, outcome = attempt.label(), "Strategy finished");
        Some(attempt)
    }

    /// Cooldown-gated GET. A 2xx response is returned as is; anything else is
    /// folded into a signal, cooling the host for block statuses and timeouts.
    async fn request(&self, fetch_url: &str, method: Method) -> Option<Result<HttpResponse, FetchAttempt>> {
        if self.cooldowns.is_in_cooldown(fetch_url).is_some() {
            debug!(fetch_url, %method, "Host cooling down; request skipped");
            return None;
        }

        let outcome = match self.http.get(fetch_url).await {
            Ok(resp) if resp.is_success() => Ok(resp),
            Ok(resp) => match self.cooldown.for_status(resp.status) {
                Some(duration) => {
                    self.cooldowns
                        .set_cooldown(fetch_url, duration, &format!("status {}", resp.status));
                    Err(FetchAttempt::Blocked {
                        status: resp.status,
                    })
                }
                None => {
                    debug!(fetch_url, status = resp.status, %method, "Non-success status");
                    Err(FetchAttempt::NoText)
                }
            },
            Err(HttpError::Timeout) => {
                self.cooldowns.set_cooldown(fetch_url, self.cooldown.timeout(), "timeout");
                Err(FetchAttempt::Timeout)
            }
            Err(e) => {
                warn!(fetch_url, error = %e, %method, "Request failed");
                Err(FetchAttempt::NoText)
            }
        };
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractConfig;
    use crate::testing::{MockHttp, article_html, article_text};

    const URL: &str = "https://news.example.com/story";
    const PROXY: &str = "https://r.jina.ai/https://news.example.com/story";

    fn chain(http: MockHttp) -> (MirrorChain<MockHttp>, Arc<CooldownTracker>) {
        let cooldowns = Arc::new(CooldownTracker::new(None, std::time::Duration::from_secs(3600)));
        let fetch = FetchConfig {
            archive_mirrors: vec!["archive.ph".into(), "archive.is".into()],
            ..FetchConfig::default()
        };
        let chain = MirrorChain::new(
            http,
            TextExtractor::new(&ExtractConfig::default()),
            cooldowns.clone(),
            fetch,
            CooldownConfig::default(),
        );
        (chain, cooldowns)
    }

    #[tokio::test]
    async fn test_direct_success_stops_the_chain() {
        let http = MockHttp::new();
        http.route(URL, 200, &article_html(120));
        let (chain, _) = chain(http.clone());

        match chain.fetch_once(URL).await {
            FetchAttempt::Success(page) => {
                assert_eq!(page.method, Method::Fetch);
                assert_eq!(page.text, article_text(120));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(http.calls(), vec![URL.to_string()]);
    }

    #[tokio::test]
    async fn test_forbidden_falls_through_to_proxy_and_cools_host() {
        let http = MockHttp::new();
        http.route(URL, 403, "denied").route(PROXY, 200, &article_text(120));
        let (chain, cooldowns) = chain(http.clone());

        match chain.fetch_once(URL).await {
            FetchAttempt::Success(page) => assert_eq!(page.method, Method::Proxy),
            other => panic!("unexpected {other:?}"),
        }
        assert!(cooldowns.is_in_cooldown(URL).is_some());

        // Second pass skips the cooling host entirely.
        chain.fetch_once(URL).await;
        assert_eq!(http.count(URL), 1);
        assert_eq!(http.count(PROXY), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_on_direct_aborts() {
        let http = MockHttp::new();
        http.route(URL, 429, "");
        let (chain, _) = chain(http.clone());
        assert_eq!(chain.fetch_once(URL).await, FetchAttempt::Blocked { status: 429 });
        assert_eq!(http.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_rate_limit_pauses_all_mirrors() {
        let http = MockHttp::new();
        http.route(&archive_url("archive.ph", URL), 429, "");
        let (chain, cooldowns) = chain(http.clone());

        chain.fetch_once(URL).await;
        assert!(!http.called(&archive_url("archive.is", URL)));
        assert!(cooldowns.is_in_cooldown(ARCHIVE_COOLDOWN_KEY).is_some());

        chain.fetch_once(URL).await;
        assert_eq!(http.count(&archive_url("archive.ph", URL)), 1);
    }

    #[tokio::test]
    async fn test_captcha_sets_long_cooldown_and_continues() {
        let http = MockHttp::new();
        http.route(URL, 200, "<html><body><div class=\"g-recaptcha\"></div></body></html>");
        http.route(&archive_url("archive.ph", URL), 200, &article_html(150));
        let (chain, cooldowns) = chain(http.clone());

        match chain.fetch_once(URL).await {
            FetchAttempt::Success(page) => assert_eq!(page.method, Method::Archive),
            other => panic!("unexpected {other:?}"),
        }
        let hit = cooldowns.is_in_cooldown(URL).unwrap();
        assert_eq!(hit.reason, "captcha");
        assert!(hit.remaining > std::time::Duration::from_secs(5 * 3600));
    }

    #[tokio::test]
    async fn test_wayback_snapshot_is_used_last() {
        let http = MockHttp::new();
        let snapshot = "http://web.archive.org/web/20250506000000/https://news.example.com/story";
        let lookup = format!(
            "https://archive.org/wayback/available?url={}",
            urlencoding::encode(URL)
        );
        http.route(
            &lookup,
            200,
            &format!(r#"{{"archived_snapshots":{{"closest":{{"available":true,"url":"{snapshot}","status":"200"}}}}}}"#),
        );
        http.route(snapshot, 200, &article_html(150));
        let (chain, _) = chain(http.clone());

        match chain.fetch_once(URL).await {
            FetchAttempt::Success(page) => assert_eq!(page.method, Method::Wayback),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wayback_lookup_respects_cooldowns() {
        let http = MockHttp::new();
        let lookup = format!(
            "https://archive.org/wayback/available?url={}",
            urlencoding::encode(URL)
        );
        http.route(&lookup, 429, "");
        let (chain, cooldowns) = chain(http.clone());

        chain.fetch_once(URL).await;
        assert_eq!(cooldowns.is_in_cooldown("archive.org").unwrap().reason, "status 429");

        chain.fetch_once(URL).await;
        assert_eq!(http.count(&lookup), 1);
    }

    #[tokio::test]
    async fn test_best_short_body_is_returned_when_nothing_better() {
        let http = MockHttp::new();
        http.route(URL, 200, "<article><p>Short teaser.</p></article>");
        http.route(PROXY, 200, "A slightly longer teaser from the proxy.");
        let (chain, _) = chain(http.clone());

        match chain.fetch_once(URL).await {
            FetchAttempt::Short(page) => {
                assert_eq!(page.method, Method::Proxy);
                assert_eq!(page.text, "A slightly longer teaser from the proxy.");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let http = MockHttp::new();
        http.timeout(URL);
        let mut fetch = FetchConfig::default();
        fetch.proxy_prefix = None;
        fetch.archive_mirrors.clear();
        fetch.wayback = false;
        let cooldowns = Arc::new(CooldownTracker::new(None, std::time::Duration::from_secs(3600)));
        let chain = MirrorChain::new(
            http,
            TextExtractor::new(&ExtractConfig::default()),
            cooldowns.clone(),
            fetch,
            CooldownConfig::default(),
        );
        let result = chain.fetch_once(URL).await;
        assert_eq!(result, FetchAttempt::Timeout);
        assert!(result.is_transient());
        assert_eq!(cooldowns.is_in_cooldown(URL).unwrap().reason, "timeout");
    }
}
