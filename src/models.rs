//! Data models shared by every pipeline stage.
//!
//! - [`TargetEvent`]: one row handed in by the storage collaborator, mutated
//!   only through [`TargetEvent::commit_accepted`] and
//!   [`TargetEvent::record_failure`]
//! - [`FetchAttempt`]: outcome of one pass over a fetch chain
//! - [`RawCandidate`]: an alternative source for the same event
//! - [`VerificationResult`]: the AI judge's decision
//! - [`FailureContext`]: why a stage gave up, threaded into the next decision
//!
//! Row fields use camelCase on the wire to match the spreadsheet export.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::bare_host;

/// How a body was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    Fetch,
    Proxy,
    Archive,
    Wayback,
    WaybackProxy,
    Browser,
    BrowserArchive,
    Cache,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Fetch => "fetch",
            Method::Proxy => "proxy",
            Method::Archive => "archive",
            Method::Wayback => "wayback",
            Method::WaybackProxy => "wayback-proxy",
            Method::Browser => "browser",
            Method::BrowserArchive => "browser-archive",
            Method::Cache => "cache",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one event's acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionStatus {
    #[default]
    Pending,
    Accepted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Ok,
    Mismatch,
    Unverified,
    Error,
    Skipped,
}

impl VerifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::Ok => "ok",
            VerifyStatus::Mismatch => "mismatch",
            VerifyStatus::Unverified => "unverified",
            VerifyStatus::Error => "error",
            VerifyStatus::Skipped => "skipped",
        }
    }
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateOrigin {
    #[default]
    Embedded,
    NewsSearch,
    ExternalSearch,
}

/// An alternative source for the same event, before classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    #[serde(default)]
    pub title: Option<String>,
    /// Direct article URL, when known.
    #[serde(default)]
    pub url: Option<String>,
    /// News-aggregator redirect link that still needs decoding.
    #[serde(default)]
    pub redirect: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Publisher homepage, used as a domain hint for redirect-only entries.
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    /// Position in the list it was discovered in (0-based).
    #[serde(default)]
    pub rank: usize,
    #[serde(default)]
    pub origin: CandidateOrigin,
}

impl RawCandidate {
    /// Host of the direct URL, falling back to the publisher homepage.
    pub fn domain(&self) -> Option<String> {
        self.url
            .as_deref()
            .and_then(bare_host)
            .or_else(|| self.source_url.as_deref().and_then(bare_host))
    }

    pub fn link(&self) -> Option<&str> {
        self.url.as_deref().or(self.redirect.as_deref())
    }
}

/// Text and provenance ready to be committed onto an event.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub html: String,
    pub text: String,
    pub method: Method,
}

/// Outcome of one pass over a fetch chain for a single URL.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchAttempt {
    Success(FetchedPage),
    /// Markup was obtained but the extracted text is under the minimum.
    Short(FetchedPage),
    Blocked { status: u16 },
    Captcha,
    Timeout,
    NoText,
}

impl FetchAttempt {
    /// Whether a second pass over the same chain could plausibly help.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchAttempt::Timeout | FetchAttempt::NoText)
    }

    pub fn label(&self) -> &'static str {
        match self {
            FetchAttempt::Success(_) => "success",
            FetchAttempt::Short(_) => "short",
            FetchAttempt::Blocked { .. } => "blocked",
            FetchAttempt::Captcha => "captcha",
            FetchAttempt::Timeout => "timeout",
            FetchAttempt::NoText => "no_text",
        }
    }
}

/// Decision returned by the match verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_match: bool,
    pub confidence: f64,
    pub reason: String,
    pub page_summary: String,
    pub status: VerifyStatus,
}

impl VerificationResult {
    /// Apply the acceptance gate: `ok` iff the judge said match with at least
    /// `min_confidence`.
    pub fn from_verdict(
        is_match: bool,
        confidence: f64,
        reason: String,
        page_summary: String,
        min_confidence: f64,
    ) -> Self {
        let status = if is_match && confidence >= min_confidence {
            VerifyStatus::Ok
        } else {
            VerifyStatus::Mismatch
        };
        Self {
            is_match,
            confidence,
            reason,
            page_summary,
            status,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::without_verdict(VerifyStatus::Skipped, reason)
    }

    pub fn unverified(reason: impl Into<String>) -> Self {
        Self::without_verdict(VerifyStatus::Unverified, reason)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::without_verdict(VerifyStatus::Error, reason)
    }

    fn without_verdict(status: VerifyStatus, reason: impl Into<String>) -> Self {
        Self {
            is_match: false,
            confidence: 0.0,
            reason: reason.into(),
            page_summary: String::new(),
            status,
        }
    }

    pub fn ok(&self) -> bool {
        self.status == VerifyStatus::Ok
    }

    /// Whether the pipeline may commit the text (verified, skipped, or
    /// fail-open unverified).
    pub fn is_accepted(&self) -> bool {
        matches!(
            self.status,
            VerifyStatus::Ok | VerifyStatus::Skipped | VerifyStatus::Unverified
        )
    }
}

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Cache,
    Network,
    Browser,
    Verify,
    Resolve,
    Candidates,
}

/// Error taxonomy recorded per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NetworkTransient,
    NetworkBlocked,
    Captcha,
    ContentTooShort,
    VerificationMismatch,
    CacheTerminal,
    ResolveFailed,
    NoCandidates,
    NoReference,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NetworkTransient => "network_transient",
            FailureKind::NetworkBlocked => "network_blocked",
            FailureKind::Captcha => "captcha",
            FailureKind::ContentTooShort => "content_too_short",
            FailureKind::VerificationMismatch => "verification_mismatch",
            FailureKind::CacheTerminal => "cache_terminal",
            FailureKind::ResolveFailed => "resolve_failed",
            FailureKind::NoCandidates => "no_candidates",
            FailureKind::NoReference => "no_reference",
        }
    }
}

/// Why a stage gave up. Returned from each stage and passed on explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub phase: Phase,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub reason: String,
}

impl FailureContext {
    pub fn new(phase: Phase, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            method: None,
            url: None,
            reason: reason.into(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Map a non-successful fetch attempt onto the failure taxonomy.
    pub fn from_attempt(phase: Phase, attempt: &FetchAttempt) -> Self {
        match attempt {
            FetchAttempt::Success(page) => {
                Self::new(phase, FailureKind::NetworkTransient, "unexpected success")
                    .with_method(page.method)
            }
            FetchAttempt::Short(page) => Self::new(
                phase,
                FailureKind::ContentTooShort,
                format!("text too short ({} chars)", page.text.chars().count()),
            )
            .with_method(page.method),
            FetchAttempt::Blocked { status } => Self::new(
                phase,
                FailureKind::NetworkBlocked,
                format!("blocked with status {status}"),
            ),
            FetchAttempt::Captcha => Self::new(phase, FailureKind::Captcha, "captcha"),
            FetchAttempt::Timeout => Self::new(phase, FailureKind::NetworkTransient, "timeout"),
            FetchAttempt::NoText => Self::new(phase, FailureKind::NetworkTransient, "no text"),
        }
    }
}

/// A logical news item as provided by the storage collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEvent {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Google News redirect link.
    #[serde(default)]
    pub gn_url: Option<String>,
    #[serde(default)]
    pub title_en: Option<String>,
    #[serde(default)]
    pub title_ru: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Embedded related-articles list shipped with the reference.
    #[serde(default)]
    pub related: Vec<RawCandidate>,

    #[serde(default)]
    pub acquisition: AcquisitionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_method: Option<Method>,
    /// `ok` once text is committed, otherwise the last failure kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_status: Option<VerifyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureContext>,
}

impl TargetEvent {
    /// Best known headline, English first.
    pub fn title(&self) -> Option<&str> {
        self.title_en
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.title_ru.as_deref().filter(|t| !t.trim().is_empty()))
    }

    pub fn parsed_date(&self) -> Option<NaiveDate> {
        self.date.as_deref().and_then(parse_loose_date)
    }

    /// Host of the event's own reference URL.
    pub fn domain(&self) -> Option<String> {
        self.url.as_deref().and_then(bare_host)
    }

    /// Commit accepted text and its provenance onto the event.
    pub fn commit_accepted(
        &mut self,
        page: &FetchedPage,
        url: &str,
        source: Option<&str>,
        verification: &VerificationResult,
    ) {
        self.acquisition = AcquisitionStatus::Accepted;
        self.text = Some(page.text.clone());
        self.text_method = Some(page.method);
        self.fetch_status = Some("ok".to_string());
        self.text_url = Some(url.to_string());
        self.text_source = source.map(str::to_string).or_else(|| self.source.clone());
        self.verify_status = Some(verification.status);
        self.verify_confidence = Some(verification.confidence);
        self.verify_reason = Some(verification.reason.clone());
        if !verification.page_summary.is_empty() {
            self.page_summary = Some(verification.page_summary.clone());
        }
        self.failure = None;
    }

    /// Record a verdict without committing text, e.g. a judge outage that
    /// stops the run. The event stays pending so a later run retries it.
    pub fn record_verification(&mut self, verification: &VerificationResult) {
        self.verify_status = Some(verification.status);
        self.verify_confidence = Some(verification.confidence);
        self.verify_reason = Some(verification.reason.clone());
    }

    /// Mark the event failed with the last known reason.
    pub fn record_failure(&mut self, failure: FailureContext) {
        self.acquisition = AcquisitionStatus::Failed;
        self.fetch_status = Some(failure.kind.as_str().to_string());
        self.failure = Some(failure);
    }
}

/// Parse the date formats seen in rows and feeds.
///
/// Accepts `YYYY-MM-DD`, `DD.MM.YYYY`, RFC 3339 and RFC 2822 timestamps.
pub fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d.%m.%Y") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.date_naive());
    }
    // "2025-05-06 14:30:00" and similar
    s.get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}
