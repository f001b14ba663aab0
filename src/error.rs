//! Error taxonomy for the acquisition pipeline.
//!
//! Only [`RunError`] ends a run. Everything else is folded into a
//! [`FailureContext`](crate::models::FailureContext) on the event and the
//! pipeline moves on to the next strategy or candidate.

use thiserror::Error;

/// Transport-level failure of a single HTTP request.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout
        } else {
            HttpError::Network(err.to_string())
        }
    }
}

/// Failure of the shared headless browser session.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation timed out")]
    Timeout,

    /// The session is gone and cannot be recreated without an operator.
    #[error("browser session closed: {0}")]
    Closed(String),

    #[error("browser failed: {0}")]
    Failed(String),
}

/// Failure talking to an AI judge.
#[derive(Debug, Error)]
pub enum JudgeError {
    /// The provider refused the request because the payload is too big.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("judge call failed: {0}")]
    Failed(String),

    #[error("judge returned non-conforming JSON: {0}")]
    Malformed(String),
}

impl JudgeError {
    pub fn is_payload_too_large(&self) -> bool {
        matches!(self, JudgeError::PayloadTooLarge(_))
    }
}

/// The verifier could not produce a decision and fail-open is disabled.
#[derive(Debug, Error)]
#[error("verifier unavailable: {0}")]
pub struct VerifyError(pub String);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search provider is cooling down ({0})")]
    CoolingDown(String),

    #[error("search request failed: {0}")]
    Http(#[from] HttpError),

    #[error("search provider returned status {0}")]
    Status(u16),

    #[error("could not parse search results: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal conditions that stop the whole run, not just the current event.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("browser session closed: {0}")]
    BrowserClosed(String),

    #[error(transparent)]
    VerifierUnavailable(#[from] VerifyError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl RunError {
    /// Process exit code surfaced to the caller for each fatal class.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::BrowserClosed(_) => 3,
            RunError::VerifierUnavailable(_) => 4,
            RunError::Cache(_) => 5,
        }
    }
}
