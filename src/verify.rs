//! AI match verification.
//!
//! The judge sees a bounded JSON payload describing the reference event and
//! the acquired page, and must answer with exactly
//! `{"match", "confidence", "reason", "page_summary"}`. A page is accepted
//! only when `match` is true and `confidence` reaches `min_confidence`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::api::AskAsync;
use crate::config::{VerifyConfig, VerifyPolicy};
use crate::error::{JudgeError, VerifyError};
use crate::models::{TargetEvent, VerificationResult};
use crate::rate_limit::RateLimiter;
use crate::utils::{char_len, looks_truncated, truncate_chars, truncate_for_log};

/// The acquired page as presented to the judge.
#[derive(Debug, Clone, Copy)]
pub struct CandidateText<'a> {
    pub title: Option<&'a str>,
    pub source: Option<&'a str>,
    pub date: Option<&'a str>,
    pub url: &'a str,
    pub text: &'a str,
    /// Text comes from an alternative candidate, not the event's own link.
    pub is_fallback: bool,
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    original: OriginalRef<'a>,
    candidate: CandidateRef<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OriginalRef<'a> {
    title: Option<&'a str>,
    description: Option<&'a str>,
    keywords: &'a [String],
    date: Option<&'a str>,
    source: Option<&'a str>,
    url: Option<&'a str>,
    gn_url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CandidateRef<'a> {
    title: Option<&'a str>,
    source: Option<&'a str>,
    date: Option<&'a str>,
    url: &'a str,
    text_snippet: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Verdict {
    #[serde(rename = "match")]
    is_match: bool,
    confidence: f64,
    reason: String,
    page_summary: String,
}

/// Whether `policy` wants the judge consulted for this text.
pub fn should_verify(policy: VerifyPolicy, is_fallback: bool, text_chars: usize, short_text_chars: usize) -> bool {
    match policy {
        VerifyPolicy::Always => true,
        VerifyPolicy::FallbackOnly => is_fallback,
        VerifyPolicy::OnlyIfShort => text_chars < short_text_chars,
        VerifyPolicy::Never => false,
    }
}

#[derive(Debug)]
pub struct MatchVerifier<J> {
    primary: J,
    fallback: Option<J>,
    limiter: RateLimiter,
    config: VerifyConfig,
}

impl<J> MatchVerifier<J>
where
    J: AskAsync<Response = String>,
{
    pub fn new(primary: J, fallback: Option<J>, config: VerifyConfig) -> Self {
        Self {
            primary,
            fallback,
            limiter: RateLimiter::new("judge", Duration::from_millis(config.min_interval_ms)),
            config,
        }
    }

    /// Judge whether `candidate` reports the same event as `event`.
    ///
    /// `Err` only when no judge could decide and fail-open is off.
    #[instrument(level = "info", skip_all, fields(event = %event.id, url = candidate.url))]
    pub async fn verify(
        &self,
        event: &TargetEvent,
        candidate: &CandidateText<'_>,
    ) -> Result<VerificationResult, VerifyError> {
        let text_chars = char_len(candidate.text);
        if !should_verify(
            self.config.policy,
            candidate.is_fallback,
            text_chars,
            self.config.short_text_chars,
        ) {
            debug!(policy = ?self.config.policy, text_chars, "Verification skipped by policy");
            return Ok(VerificationResult::skipped(format!("policy {:?}", self.config.policy)));
        }

        let verdict = match self.ask_provider(&self.primary, event, candidate).await {
            Ok(v) => Ok(v),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(error = %e, "Primary judge failed; trying fallback judge");
                    self.ask_provider(fallback, event, candidate).await
                }
                None => Err(e),
            },
        };

        match verdict {
            Ok(v) => {
                let result = VerificationResult::from_verdict(
                    v.is_match,
                    v.confidence,
                    v.reason,
                    v.page_summary,
                    self.config.min_confidence,
                );
                info!(
                    status = result.status.as_str(),
                    confidence = result.confidence,
                    reason = %truncate_for_log(&result.reason, 200),
                    "Verification finished"
                );
                Ok(result)
            }
            Err(e) if self.config.fail_open => {
                warn!(error = %e, "Judge unavailable; accepting unverified");
                Ok(VerificationResult::unverified(e.to_string()))
            }
            Err(e) => Err(VerifyError(e.to_string())),
        }
    }

    /// One provider, shrinking the payload once if it is rejected as too large.
    async fn ask_provider(
        &self,
        judge: &J,
        event: &TargetEvent,
        candidate: &CandidateText<'_>,
    ) -> Result<Verdict, JudgeError> {
        let payload = self.payload(event, candidate, self.config.max_text_chars)?;
        match self.ask_parsed(judge, &payload).await {
            Err(e) if e.is_payload_too_large() => {
                warn!(
                    limit = self.config.fallback_max_text_chars,
                    "Payload too large; retrying with shorter text"
                );
                let smaller = self.payload(event, candidate, self.config.fallback_max_text_chars)?;
                self.ask_parsed(judge, &smaller).await
            }
            other => other,
        }
    }

    /// Ask and parse, re-asking once when the answer was cut off.
    async fn ask_parsed(&self, judge: &J, payload: &str) -> Result<Verdict, JudgeError> {
        self.limiter.acquire().await;
        let raw = judge.ask(payload).await?;
        match parse_verdict(&raw) {
            Ok(v) => Ok(v),
            Err(e) if looks_truncated(&e) => {
                warn!(response = %truncate_for_log(&raw, 200), "Judge response truncated; asking again");
                self.limiter.acquire().await;
                let raw = judge.ask(payload).await?;
                parse_verdict(&raw).map_err(|e| JudgeError::Malformed(format!("{e}: {}", truncate_for_log(&raw, 200))))
            }
            Err(e) => Err(JudgeError::Malformed(format!("{e}: {}", truncate_for_log(&raw, 200)))),
        }
    }

    fn payload(&self, event: &TargetEvent, candidate: &CandidateText<'_>, max_text: usize) -> Result<String, JudgeError> {
        let payload = Payload {
            original: OriginalRef {
                title: event.title(),
                description: event.description.as_deref().or(event.summary.as_deref()),
                keywords: &event.keywords,
                date: event.date.as_deref(),
                source: event.source.as_deref(),
                url: event.url.as_deref(),
                gn_url: event.gn_url.as_deref(),
            },
            candidate: CandidateRef {
                title: candidate.title,
                source: candidate.source,
                date: candidate.date,
                url: candidate.url,
                text_snippet: truncate_chars(candidate.text, self.config.snippet_chars),
                text: truncate_chars(candidate.text, max_text),
            },
        };
        serde_json::to_string(&payload).map_err(|e| JudgeError::Failed(e.to_string()))
    }
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_verdict(raw: &str) -> Result<Verdict, serde_json::Error> {
    let verdict: Verdict = serde_json::from_str(strip_code_fences(raw))?;
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(serde::de::Error::custom(format!(
            "confidence {} outside 0..=1",
            verdict.confidence
        )));
    }
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VerifyStatus;
    use crate::testing::{MockJudge, article_text, verdict_json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> TargetEvent {
        TargetEvent {
            id: "7".into(),
            url: Some("https://origin.example.com/a".into()),
            title_en: Some("Central bank raises key rate to 21%".into()),
            source: Some("Origin".into()),
            date: Some("2025-05-06".into()),
            keywords: vec!["rates".into()],
            ..Default::default()
        }
    }

    fn candidate(text: &str) -> CandidateText<'_> {
        CandidateText {
            title: Some("Bank lifts rate"),
            source: Some("Reuters"),
            date: Some("2025-05-06"),
            url: "https://www.reuters.com/x",
            text,
            is_fallback: true,
        }
    }

    fn config() -> VerifyConfig {
        VerifyConfig {
            min_interval_ms: 0,
            ..VerifyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_confident_match_is_ok_and_payload_has_contract_fields() {
        let judge = MockJudge::verdict(true, 0.7);
        let verifier = MatchVerifier::new(judge.clone(), None, config());
        let text = article_text(50);
        let result = verifier.verify(&event(), &candidate(&text)).await.unwrap();
        assert_eq!(result.status, VerifyStatus::Ok);

        let sent: serde_json::Value = serde_json::from_str(&judge.calls()[0]).unwrap();
        assert_eq!(sent["original"]["title"], "Central bank raises key rate to 21%");
        assert_eq!(sent["original"]["gnUrl"], serde_json::Value::Null);
        assert_eq!(sent["candidate"]["source"], "Reuters");
        assert!(sent["candidate"]["textSnippet"].as_str().unwrap().len() <= 600);
    }

    #[tokio::test]
    async fn test_low_confidence_is_mismatch() {
        let verifier = MatchVerifier::new(MockJudge::verdict(true, 0.69), None, config());
        let result = verifier.verify(&event(), &candidate("text")).await.unwrap();
        assert_eq!(result.status, VerifyStatus::Mismatch);
    }

    #[tokio::test]
    async fn test_fenced_response_is_accepted() {
        let judge = MockJudge::new(|_| Ok(format!("```json\n{}\n```", verdict_json(true, 0.95))));
        let verifier = MatchVerifier::new(judge, None, config());
        assert!(verifier.verify(&event(), &candidate("t")).await.unwrap().ok());
    }

    #[tokio::test]
    async fn test_extra_fields_fail_closed() {
        let judge = MockJudge::new(|_| {
            Ok(r#"{"match":true,"confidence":0.9,"reason":"r","page_summary":"s","extra":1}"#.into())
        });
        let verifier = MatchVerifier::new(judge, None, config());
        assert!(verifier.verify(&event(), &candidate("t")).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_open_returns_unverified() {
        let cfg = VerifyConfig {
            fail_open: true,
            ..config()
        };
        let verifier = MatchVerifier::new(MockJudge::failing(), None, cfg);
        let result = verifier.verify(&event(), &candidate("t")).await.unwrap();
        assert_eq!(result.status, VerifyStatus::Unverified);
        assert!(result.is_accepted());
    }

    #[tokio::test]
    async fn test_fallback_provider_is_used_on_failure() {
        let fallback = MockJudge::verdict(true, 0.9);
        let verifier = MatchVerifier::new(MockJudge::failing(), Some(fallback.clone()), config());
        assert!(verifier.verify(&event(), &candidate("t")).await.unwrap().ok());
        assert_eq!(fallback.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_oversize_payload_is_shrunk_once() {
        let judge = MockJudge::new(|payload| {
            let v: serde_json::Value = serde_json::from_str(payload).unwrap();
            let text_len = v["candidate"]["text"].as_str().unwrap().chars().count();
            if text_len > 2_500 {
                Err(JudgeError::PayloadTooLarge("413".into()))
            } else {
                Ok(verdict_json(true, 0.8))
            }
        });
        let verifier = MatchVerifier::new(judge.clone(), None, config());
        let text = "x".repeat(10_000);
        assert!(verifier.verify(&event(), &candidate(&text)).await.unwrap().ok());
        assert_eq!(judge.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_truncated_response_is_reasked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let judge = MockJudge::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(r#"{"match": true, "confidence": 0.9, "rea"#.into())
            } else {
                Ok(verdict_json(true, 0.9))
            }
        });
        let verifier = MatchVerifier::new(judge, None, config());
        assert!(verifier.verify(&event(), &candidate("t")).await.unwrap().ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_policy_can_skip_the_judge() {
        let judge = MockJudge::verdict(false, 0.0);
        let cfg = VerifyConfig {
            policy: VerifyPolicy::FallbackOnly,
            ..config()
        };
        let verifier = MatchVerifier::new(judge.clone(), None, cfg);
        let mut own = candidate("t");
        own.is_fallback = false;
        let result = verifier.verify(&event(), &own).await.unwrap();
        assert_eq!(result.status, VerifyStatus::Skipped);
        assert!(judge.calls().is_empty());
    }

    #[test]
    fn test_policy_table() {
        assert!(should_verify(VerifyPolicy::Always, false, 10_000, 1_500));
        assert!(!should_verify(VerifyPolicy::Never, true, 10, 1_500));
        assert!(should_verify(VerifyPolicy::OnlyIfShort, false, 1_499, 1_500));
        assert!(!should_verify(VerifyPolicy::OnlyIfShort, false, 1_500, 1_500));
        assert!(should_verify(VerifyPolicy::FallbackOnly, true, 0, 1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_judge_calls_are_spaced() {
        let cfg = VerifyConfig {
            min_interval_ms: 1_500,
            ..VerifyConfig::default()
        };
        let verifier = MatchVerifier::new(MockJudge::verdict(true, 0.9), None, cfg);
        let t0 = tokio::time::Instant::now();
        verifier.verify(&event(), &candidate("a")).await.unwrap();
        verifier.verify(&event(), &candidate("b")).await.unwrap();
        assert!(t0.elapsed() >= Duration::from_millis(1_500));
    }

    #[test]
    fn test_fence_stripping() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }
}
