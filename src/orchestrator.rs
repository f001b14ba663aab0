//! Per-event acquisition state machine.
//!
//! ```text
//! Start → CacheProbe → {CacheAccept | CacheRejectTerminal | CacheMiss}
//!       → NetworkFetch(1..=attempts) → BrowserFetch → Verify
//!       → {Accepted | Mismatch | Exhausted} → FallbackCandidateLoop → {Accepted | Failed}
//! ```
//!
//! Events are processed one at a time, strategies strictly in order. The only
//! errors that escape [`Pipeline::acquire`] are [`RunError`]s; everything else
//! becomes a [`FailureContext`] on the event.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::api::AskAsync;
use crate::cache::{CacheMeta, CacheStatus, ContentCache};
use crate::candidates::links::Resolution;
use crate::candidates::{Candidate, CandidateEngine, Exclusions};
use crate::config::PipelineConfig;
use crate::cooldown::CooldownTracker;
use crate::error::{BrowserError, RunError};
use crate::extract::TextExtractor;
use crate::fetchers::browser::{BrowserAcquirer, BrowserSession};
use crate::fetchers::http::HttpGet;
use crate::fetchers::mirrors::MirrorChain;
use crate::fetchers::worse;
use crate::models::{
    AcquisitionStatus, FailureContext, FailureKind, FetchAttempt, FetchedPage, Method, Phase, TargetEvent,
    VerificationResult,
};
use crate::verify::{CandidateText, MatchVerifier};

/// The URL being attempted and how to present it to the judge.
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    url: &'a str,
    title: Option<&'a str>,
    source: Option<&'a str>,
    date: Option<&'a str>,
    is_fallback: bool,
}

enum UrlOutcome {
    Accepted {
        page: FetchedPage,
        verification: VerificationResult,
    },
    Rejected(FailureContext),
}

/// Result of one event's acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionOutcome {
    pub status: AcquisitionStatus,
    /// Every non-fatal failure met on the way, in order.
    pub failures: Vec<FailureContext>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventFailures {
    pub id: String,
    pub failures: Vec<FailureContext>,
}

/// End-of-run summary written next to the events file.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub accepted: usize,
    pub failed: usize,
    /// Events already accepted by an earlier run.
    pub skipped: usize,
    pub fatal: Option<String>,
    pub failures: Vec<EventFailures>,
}

impl RunReport {
    fn start(total: usize) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            total,
            accepted: 0,
            failed: 0,
            skipped: 0,
            fatal: None,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub fatal: Option<RunError>,
}

pub struct Pipeline<H, B, J> {
    cache: ContentCache,
    extractor: TextExtractor,
    chain: MirrorChain<H>,
    browser: Option<BrowserAcquirer<B>>,
    verifier: MatchVerifier<J>,
    candidates: CandidateEngine<H>,
    cooldowns: Arc<CooldownTracker>,
    fetch_attempts: usize,
    blocked_ttl: ChronoDuration,
}

impl<H, B, J> Pipeline<H, B, J>
where
    H: HttpGet + Clone,
    B: BrowserSession,
    J: AskAsync<Response = String>,
{
    pub fn new(config: &PipelineConfig, http: H, browser: Option<B>, verifier: MatchVerifier<J>) -> Self {
        let cooldowns = Arc::new(CooldownTracker::from_config(&config.cooldown));
        let extractor = TextExtractor::new(&config.extract);
        let chain = MirrorChain::new(
            http.clone(),
            extractor.clone(),
            cooldowns.clone(),
            config.fetch.clone(),
            config.cooldown.clone(),
        );
        let browser = browser.filter(|_| config.browser.enabled).map(|session| {
            BrowserAcquirer::new(
                session,
                extractor.clone(),
                cooldowns.clone(),
                config.cooldown.clone(),
                config.fetch.archive_mirrors.first().cloned(),
                config.browser.archive_first,
            )
        });
        let candidates = CandidateEngine::new(
            http,
            config.candidates.clone(),
            config.authority.clone(),
            cooldowns.clone(),
        );
        Self {
            cache: ContentCache::new(&config.cache),
            extractor,
            chain,
            browser,
            verifier,
            candidates,
            cooldowns,
            fetch_attempts: config.fetch.attempts.max(1),
            blocked_ttl: ChronoDuration::hours(config.cache.blocked_ttl_hours),
        }
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    /// Process `events` in order, calling `on_ready` after each one reaches
    /// a terminal state. Stops at the first fatal error and closes the browser.
    pub async fn run_all<F>(&self, events: &mut [TargetEvent], mut on_ready: F) -> RunOutcome
    where
        F: AsyncFnMut(&[TargetEvent], usize),
    {
        let mut report = RunReport::start(events.len());
        let mut fatal = None;

        for i in 0..events.len() {
            match self.acquire(&mut events[i]).await {
                Ok(outcome) => {
                    match outcome.status {
                        AcquisitionStatus::Accepted => report.accepted += 1,
                        AcquisitionStatus::Failed => report.failed += 1,
                        AcquisitionStatus::Pending => report.skipped += 1,
                    }
                    if !outcome.failures.is_empty() {
                        report.failures.push(EventFailures {
                            id: events[i].id.clone(),
                            failures: outcome.failures,
                        });
                    }
                    on_ready(&*events, i).await;
                }
                Err(e) => {
                    error!(event = %events[i].id, error = %e, "Fatal error; stopping run");
                    report.fatal = Some(e.to_string());
                    fatal = Some(e);
                    break;
                }
            }
        }

        self.shutdown().await;
        report.finished_at = Utc::now();
        info!(
            total = report.total,
            accepted = report.accepted,
            failed = report.failed,
            skipped = report.skipped,
            fatal = report.fatal.is_some(),
            "Run finished"
        );
        RunOutcome { report, fatal }
    }

    pub async fn shutdown(&self) {
        if let Some(browser) = &self.browser {
            browser.session().close().await;
        }
    }

    /// Acquire verified text for one event. An event accepted by an earlier
    /// run is left alone and reported as `Pending`.
    #[instrument(level = "info", skip_all, fields(event = %event.id))]
    pub async fn acquire(&self, event: &mut TargetEvent) -> Result<AcquisitionOutcome, RunError> {
        if event.acquisition == AcquisitionStatus::Accepted && event.text.is_some() {
            debug!("Already accepted; skipping");
            return Ok(AcquisitionOutcome {
                status: AcquisitionStatus::Pending,
                failures: Vec::new(),
            });
        }

        let mut failures = Vec::new();
        let mut exclusions = self.candidates.exclusions(event);

        if let Some(url) = self.primary_url(event, &mut failures).await {
            exclusions.add_url(&url);
            let title = event.title().map(str::to_string);
            let source = event.source.clone();
            let date = event.date.clone();
            let target = Target {
                url: &url,
                title: title.as_deref(),
                source: source.as_deref(),
                date: date.as_deref(),
                is_fallback: false,
            };
            match self.attempt_url(event, target).await? {
                UrlOutcome::Accepted { page, verification } => {
                    event.commit_accepted(&page, &url, source.as_deref(), &verification);
                    info!(method = %page.method, url = %url, "Accepted primary text");
                    return Ok(AcquisitionOutcome {
                        status: AcquisitionStatus::Accepted,
                        failures,
                    });
                }
                UrlOutcome::Rejected(ctx) => failures.push(ctx),
            }
        }

        if self.fallback(event, &mut exclusions, &mut failures).await? {
            return Ok(AcquisitionOutcome {
                status: AcquisitionStatus::Accepted,
                failures,
            });
        }

        let last = failures
            .iter()
            .rev()
            .find(|f| f.kind != FailureKind::NoCandidates)
            .or(failures.last())
            .cloned()
            .unwrap_or_else(|| FailureContext::new(Phase::Candidates, FailureKind::NoCandidates, "nothing to try"));
        warn!(kind = ?last.kind, reason = %last.reason, "Acquisition failed");
        event.record_failure(last);
        Ok(AcquisitionOutcome {
            status: AcquisitionStatus::Failed,
            failures,
        })
    }

    /// The event's own article URL, decoding its redirect when needed.
    async fn primary_url(&self, event: &TargetEvent, failures: &mut Vec<FailureContext>) -> Option<String> {
        if let Some(url) = event.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(url.trim().to_string());
        }
        let Some(link) = event.gn_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            failures.push(FailureContext::new(Phase::Resolve, FailureKind::NoReference, "event has no link"));
            return None;
        };
        match self.candidates.resolve_link(link).await {
            Resolution::Resolved(url) => Some(url),
            Resolution::Deferred => {
                failures.push(
                    FailureContext::new(Phase::Resolve, FailureKind::ResolveFailed, "redirect decoding deferred")
                        .with_url(link),
                );
                None
            }
            Resolution::Failed(reason) => {
                failures.push(FailureContext::new(Phase::Resolve, FailureKind::ResolveFailed, reason).with_url(link));
                None
            }
        }
    }

    /// Embedded candidates first, search results only if none of them worked.
    async fn fallback(
        &self,
        event: &mut TargetEvent,
        exclusions: &mut Exclusions,
        failures: &mut Vec<FailureContext>,
    ) -> Result<bool, RunError> {
        let embedded = self.candidates.embedded(event);
        if !embedded.is_empty() {
            let queue = self.candidates.classify(event, embedded, exclusions).accepted;
            if self.run_queue(event, queue, exclusions, failures).await? {
                return Ok(true);
            }
        }

        let found = self.candidates.search(event).await;
        let queue = self.candidates.classify(event, found, exclusions).accepted;
        if queue.is_empty() {
            failures.push(FailureContext::new(
                Phase::Candidates,
                FailureKind::NoCandidates,
                "no usable alternative candidates",
            ));
            return Ok(false);
        }
        self.run_queue(event, queue, exclusions, failures).await
    }

    /// Try each candidate in rank order; one deferred candidate gets a second
    /// chance after the rest.
    async fn run_queue(
        &self,
        event: &mut TargetEvent,
        queue: Vec<Candidate>,
        exclusions: &mut Exclusions,
        failures: &mut Vec<FailureContext>,
    ) -> Result<bool, RunError> {
        let mut deferred: Option<Candidate> = None;

        for candidate in queue {
            match self.candidates.resolve(&candidate).await {
                Resolution::Resolved(url) => {
                    if self.try_candidate(event, &candidate, &url, exclusions, failures).await? {
                        return Ok(true);
                    }
                }
                Resolution::Deferred if deferred.is_none() => {
                    debug!(link = ?candidate.link(), "Candidate deferred");
                    deferred = Some(candidate);
                }
                Resolution::Deferred => failures.push(resolve_failure(&candidate, "redirect decoding deferred")),
                Resolution::Failed(reason) => failures.push(resolve_failure(&candidate, &reason)),
            }
        }

        if let Some(candidate) = deferred {
            match self.candidates.resolve(&candidate).await {
                Resolution::Resolved(url) => {
                    return self.try_candidate(event, &candidate, &url, exclusions, failures).await;
                }
                Resolution::Deferred => failures.push(resolve_failure(&candidate, "redirect decoding deferred twice")),
                Resolution::Failed(reason) => failures.push(resolve_failure(&candidate, &reason)),
            }
        }
        Ok(false)
    }

    async fn try_candidate(
        &self,
        event: &mut TargetEvent,
        candidate: &Candidate,
        url: &str,
        exclusions: &mut Exclusions,
        failures: &mut Vec<FailureContext>,
    ) -> Result<bool, RunError> {
        if let Some(reason) = self.candidates.recheck(url, exclusions) {
            info!(url, reason = reason.as_str(), "Resolved candidate rejected");
            failures.push(
                FailureContext::new(Phase::Candidates, FailureKind::NoCandidates, reason.as_str()).with_url(url),
            );
            return Ok(false);
        }
        exclusions.add_url(url);
        if let Some(link) = candidate.link() {
            exclusions.add_url(link);
        }

        let target = Target {
            url,
            title: candidate.raw.title.as_deref(),
            source: candidate.source_name(),
            date: candidate.raw.date.as_deref(),
            is_fallback: true,
        };
        match self.attempt_url(event, target).await? {
            UrlOutcome::Accepted { page, verification } => {
                event.commit_accepted(&page, url, candidate.source_name(), &verification);
                info!(method = %page.method, url, source = ?candidate.source_name(), "Accepted candidate text");
                Ok(true)
            }
            UrlOutcome::Rejected(ctx) => {
                failures.push(ctx);
                Ok(false)
            }
        }
    }

    /// Cache, network, browser, verify for one URL.
    #[instrument(level = "info", skip(self, event, target), fields(url = target.url, fallback = target.is_fallback))]
    async fn attempt_url(&self, event: &mut TargetEvent, target: Target<'_>) -> Result<UrlOutcome, RunError> {
        let url = target.url;

        let probe = self.cache.probe(url).await;
        if let Some(status) = probe.terminal_status(Utc::now(), self.blocked_ttl) {
            info!(status = status.as_str(), "Cached status is terminal; not retrying");
            return Ok(UrlOutcome::Rejected(
                FailureContext::new(
                    Phase::Cache,
                    FailureKind::CacheTerminal,
                    format!("cached status {}", status.as_str()),
                )
                .with_url(url),
            ));
        }
        if probe.has_body {
            if let Some(outcome) = self.from_cache(event, target).await? {
                return Ok(outcome);
            }
        }

        let (attempt, phase) = self.fetch(url).await?;
        let page = match attempt {
            FetchAttempt::Success(page) => page,
            FetchAttempt::Short(page) => {
                let meta = CacheMeta::new(url, CacheStatus::Short, Some(page.method.as_str()));
                self.store(event, url, Some(&page), meta, !target.is_fallback).await?;
                return Ok(UrlOutcome::Rejected(
                    FailureContext::from_attempt(phase, &FetchAttempt::Short(page)).with_url(url),
                ));
            }
            other @ (FetchAttempt::Blocked { .. } | FetchAttempt::Captcha) => {
                let meta = CacheMeta::new(url, CacheStatus::Blocked, None);
                self.store(event, url, None, meta, !target.is_fallback).await?;
                return Ok(UrlOutcome::Rejected(FailureContext::from_attempt(phase, &other).with_url(url)));
            }
            other => {
                return Ok(UrlOutcome::Rejected(FailureContext::from_attempt(phase, &other).with_url(url)));
            }
        };

        self.judge(event, target, page).await
    }

    /// Reuse a cached body. `None` when the cached text is not usable.
    async fn from_cache(&self, event: &mut TargetEvent, target: Target<'_>) -> Result<Option<UrlOutcome>, RunError> {
        let Some(bodies) = self.cache.read(target.url).await? else {
            return Ok(None);
        };
        if !self.extractor.is_acceptable(&bodies.text) {
            debug!("Cached text below minimum; fetching again");
            return Ok(None);
        }
        let page = FetchedPage {
            html: bodies.markup,
            text: bodies.text,
            method: Method::Cache,
        };
        let cached_method = bodies.meta.as_ref().and_then(|m| m.method.clone());
        if bodies.meta.is_some_and(|m| m.status == CacheStatus::Ok) {
            info!("Using previously verified cached text");
            return Ok(Some(UrlOutcome::Accepted {
                page,
                verification: VerificationResult::skipped("previously verified"),
            }));
        }

        let url = target.url;
        let outcome = self.judge(event, target, page).await?;
        if let UrlOutcome::Accepted { verification, .. } = &outcome {
            if verification.ok() {
                let verified = CacheMeta::new(url, CacheStatus::Ok, cached_method.as_deref());
                self.store(event, url, None, verified, false).await?;
            }
        }
        Ok(Some(outcome))
    }

    /// Network passes, then the browser if the network did not succeed.
    async fn fetch(&self, url: &str) -> Result<(FetchAttempt, Phase), RunError> {
        let mut attempt = FetchAttempt::NoText;
        for n in 1..=self.fetch_attempts {
            attempt = self.chain.fetch_once(url).await;
            if !attempt.is_transient() {
                break;
            }
            debug!(attempt = n, outcome = attempt.label(), "Transient network outcome");
        }
        if matches!(attempt, FetchAttempt::Success(_)) {
            return Ok((attempt, Phase::Network));
        }

        let Some(browser) = &self.browser else {
            return Ok((attempt, Phase::Network));
        };
        let rendered = match browser.acquire(url).await {
            Ok(a) => a,
            Err(BrowserError::Closed(reason)) => return Err(RunError::BrowserClosed(reason)),
            Err(e) => {
                warn!(error = %e, "Browser acquisition failed");
                FetchAttempt::NoText
            }
        };
        let combined = match (attempt, rendered) {
            (_, success @ FetchAttempt::Success(_)) => success,
            (FetchAttempt::Short(a), FetchAttempt::Short(b)) => {
                FetchAttempt::Short(if b.text.chars().count() > a.text.chars().count() { b } else { a })
            }
            (short @ FetchAttempt::Short(_), _) | (_, short @ FetchAttempt::Short(_)) => short,
            (network, browser) => worse(network, browser),
        };
        Ok((combined, Phase::Browser))
    }

    /// Ask the verifier and cache the page according to the verdict.
    async fn judge(&self, event: &mut TargetEvent, target: Target<'_>, page: FetchedPage) -> Result<UrlOutcome, RunError> {
        let candidate = CandidateText {
            title: target.title,
            source: target.source,
            date: target.date,
            url: target.url,
            text: &page.text,
            is_fallback: target.is_fallback,
        };
        let verification = match self.verifier.verify(event, &candidate).await {
            Ok(v) => v,
            Err(e) => {
                event.record_verification(&VerificationResult::error(e.to_string()));
                return Err(e.into());
            }
        };

        if verification.is_accepted() {
            if page.method != Method::Cache {
                let status = if verification.ok() { CacheStatus::Ok } else { CacheStatus::Unset };
                let meta = CacheMeta::new(target.url, status, Some(page.method.as_str()));
                self.store(event, target.url, Some(&page), meta, false).await?;
            }
            return Ok(UrlOutcome::Accepted { page, verification });
        }

        // Kept as evidence; never committed onto the event.
        let meta = CacheMeta::new(target.url, CacheStatus::Mismatch, Some(page.method.as_str()));
        self.store(event, target.url, Some(&page), meta, false).await?;
        Ok(UrlOutcome::Rejected(
            FailureContext::new(
                Phase::Verify,
                FailureKind::VerificationMismatch,
                format!("{} (confidence {:.2})", verification.reason, verification.confidence),
            )
            .with_method(page.method)
            .with_url(target.url),
        ))
    }

    /// Cache write helper. With `mutate_event` the cache status is also
    /// recorded as the event's fetch status.
    async fn store(
        &self,
        event: &mut TargetEvent,
        url: &str,
        page: Option<&FetchedPage>,
        meta: CacheMeta,
        mutate_event: bool,
    ) -> Result<(), RunError> {
        let status = meta.status;
        match page {
            Some(page) => {
                self.cache.write(url, &page.html, &page.text, &meta).await?;
            }
            None => self.cache.write_meta_only(url, &meta).await?,
        }
        if mutate_event && status != CacheStatus::Unset {
            event.fetch_status = Some(status.as_str().to_string());
        }
        Ok(())
    }
}

fn resolve_failure(candidate: &Candidate, reason: &str) -> FailureContext {
    let ctx = FailureContext::new(Phase::Resolve, FailureKind::ResolveFailed, reason);
    match candidate.link() {
        Some(link) => ctx.with_url(link),
        None => ctx,
    }
}

#[cfg(test)]
mod tests;
