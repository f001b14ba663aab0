//! AI judge client with exponential backoff retry logic.
//!
//! - [`AskAsync`]: core trait for one judge round trip
//! - [`AwfulJudge`]: wraps `awful_aj::api::ask` with a loaded config and template
//! - [`RetryAsk`]: decorator adding retries to any [`AskAsync`] implementation
//!
//! # Retry Strategy
//!
//! - Exponential backoff from `base_delay`, capped at 30 seconds
//! - Random jitter (0-250ms) added to every delay
//! - Payload-too-large errors are returned immediately; the verifier shrinks
//!   the payload instead

use awful_aj::api::ask;
use awful_aj::{config::AwfulJadeConfig, template::ChatTemplate};
use rand::{Rng, rng};
use std::fmt;
use std::time::{Duration as StdDuration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

use crate::error::JudgeError;

/// Async round trip to an AI judge.
pub trait AskAsync {
    /// The type of response returned by the judge.
    type Response;

    /// Send `text` and wait for the response.
    async fn ask(&self, text: &str) -> Result<Self::Response, JudgeError>;
}

/// Wrapper that adds exponential backoff retry logic to any [`AskAsync`] implementation.
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryAsk<T> {
    inner: T,
    max_retries: usize,
    base_delay: StdDuration,
    max_delay: StdDuration,
}

impl<T> RetryAsk<T>
where
    T: AskAsync,
{
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }
}

impl<T> fmt::Debug for RetryAsk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAsk")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> AskAsync for RetryAsk<T>
where
    T: AskAsync + fmt::Debug,
{
    type Response = T::Response;

    #[instrument(level = "info", skip_all)]
    async fn ask(&self, text: &str) -> Result<Self::Response, JudgeError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.ask(text).await {
                Ok(resp) => {
                    return Ok(resp);
                }
                Err(e) if e.is_payload_too_large() => {
                    warn!(error = %e, "Judge rejected payload size; not retrying");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u128,
                            elapsed_ms_total = total_dt.as_millis() as u128,
                            error = %e,
                            "ask() exhausted retries"
                        );
                        return Err(e);
                    }

                    // backoff calc
                    let mut delay = self.base_delay.saturating_mul(1 << (attempt - 1));
                    if delay > self.max_delay {
                        delay = self.max_delay;
                    }
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + StdDuration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u128,
                        elapsed_ms_total = total_dt.as_millis() as u128,
                        ?delay,
                        error = %e,
                        "ask() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// `awful_aj` provider: one loaded config plus the verification template.
pub struct AwfulJudge {
    pub name: String,
    pub config: AwfulJadeConfig,
    pub template: ChatTemplate,
}

impl fmt::Debug for AwfulJudge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwfulJudge").field("name", &self.name).finish()
    }
}

impl AskAsync for AwfulJudge {
    type Response = String;

    #[instrument(level = "info", skip_all, fields(judge = %self.name))]
    async fn ask(&self, text: &str) -> Result<Self::Response, JudgeError> {
        let t0 = Instant::now();
        let res = ask(&self.config, text.to_string(), &self.template, None, None).await;
        let dt = t0.elapsed();

        res.map_err(|e| {
            let msg = e.to_string();
            warn!(elapsed_ms = dt.as_millis() as u128, error = %msg, "API call failed");
            classify_failure(msg)
        })
    }
}

/// Map a provider error message onto [`JudgeError`].
pub fn classify_failure(msg: String) -> JudgeError {
    let lower = msg.to_lowercase();
    let too_large = ["413", "too large", "context length", "context_length", "maximum context", "too many tokens"]
        .iter()
        .any(|p| lower.contains(p));
    if too_large {
        JudgeError::PayloadTooLarge(msg)
    } else {
        JudgeError::Failed(msg)
    }
}
