//! Pipeline configuration loaded from YAML.
//!
//! Every field has a default so an empty or partial file is valid. The AI
//! judge itself is configured separately through `awful_aj`'s own
//! `config.yaml` and chat template.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

use crate::candidates::authority::SourceAuthority;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub extract: ExtractConfig,
    pub fetch: FetchConfig,
    pub cooldown: CooldownConfig,
    pub browser: BrowserConfig,
    pub verify: VerifyConfig,
    pub candidates: CandidateConfig,
    pub authority: SourceAuthority,
}

impl PipelineConfig {
    /// Load from `path`, or return defaults when no path is given.
    #[instrument(level = "info")]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            info!("No pipeline config given; using defaults");
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!(path = %path.display(), "Loaded pipeline config");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.verify.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "verify.min_confidence must be within 0..=1, got {}",
                self.verify.min_confidence
            )));
        }
        if self.extract.min_chars == 0 {
            return Err(ConfigError::Invalid("extract.min_chars must be positive".into()));
        }
        if self.fetch.attempts == 0 {
            return Err(ConfigError::Invalid("fetch.attempts must be at least 1".into()));
        }
        if self.verify.fallback_max_text_chars > self.verify.max_text_chars {
            return Err(ConfigError::Invalid(
                "verify.fallback_max_text_chars must not exceed verify.max_text_chars".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Extracted text is truncated to this many characters.
    pub max_text_chars: usize,
    pub max_markup_bytes: usize,
    /// A cached `blocked` status stops being terminal after this many hours.
    pub blocked_ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache/articles"),
            max_text_chars: 30_000,
            max_markup_bytes: 3_000_000,
            blocked_ttl_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub min_chars: usize,
    /// Markup above this size skips structured-data and DOM passes.
    pub max_markup_bytes: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            min_chars: 400,
            max_markup_bytes: 1_500_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub accept_language: String,
    /// Text-rendering proxy; the target URL is appended verbatim.
    pub proxy_prefix: Option<String>,
    pub archive_mirrors: Vec<String>,
    pub wayback: bool,
    pub wayback_api: String,
    /// Passes over the mirror chain before handing over to the browser.
    pub attempts: usize,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
                .to_string(),
            accept_language: "en-US,en;q=0.9,ru;q=0.8".to_string(),
            proxy_prefix: Some("https://r.jina.ai/".to_string()),
            archive_mirrors: ["archive.ph", "archive.is", "archive.li", "archive.md", "archive.vn"]
                .into_iter()
                .map(String::from)
                .collect(),
            wayback: true,
            wayback_api: "https://archive.org/wayback/available".to_string(),
            attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub captcha_secs: u64,
    pub rate_limited_secs: u64,
    pub unauthorized_secs: u64,
    pub forbidden_secs: u64,
    pub unavailable_secs: u64,
    pub gateway_timeout_secs: u64,
    pub timeout_secs: u64,
    /// Archive-wide pause after any mirror answers 429.
    pub archive_rate_limited_secs: u64,
    /// Let one request through a long cooldown this often. `None` disables.
    pub probe_interval_secs: Option<u64>,
    /// Only cooldowns at least this long are probed.
    pub probe_min_cooldown_secs: u64,
}

impl CooldownConfig {
    /// Cooldown for a blocking HTTP status, `None` when the status is not a
    /// block signal.
    pub fn for_status(&self, status: u16) -> Option<Duration> {
        let secs = match status {
            401 => self.unauthorized_secs,
            403 => self.forbidden_secs,
            429 => self.rate_limited_secs,
            503 => self.unavailable_secs,
            504 => self.gateway_timeout_secs,
            _ => return None,
        };
        Some(Duration::from_secs(secs))
    }

    pub fn captcha(&self) -> Duration {
        Duration::from_secs(self.captcha_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn archive_rate_limited(&self) -> Duration {
        Duration::from_secs(self.archive_rate_limited_secs)
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            captcha_secs: 6 * 3600,
            rate_limited_secs: 30 * 60,
            unauthorized_secs: 3600,
            forbidden_secs: 2 * 3600,
            unavailable_secs: 15 * 60,
            gateway_timeout_secs: 10 * 60,
            timeout_secs: 2 * 60,
            archive_rate_limited_secs: 3600,
            probe_interval_secs: Some(30 * 60),
            probe_min_cooldown_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub enabled: bool,
    /// Chromium binary; falls back to `$CHROME_BIN`, then `chromium`.
    pub chrome_bin: Option<String>,
    pub profile_dir: PathBuf,
    pub nav_timeout_secs: u64,
    /// Render an archive mirror page before the original URL.
    pub archive_first: bool,
}

impl BrowserConfig {
    pub fn nav_timeout(&self) -> Duration {
        Duration::from_secs(self.nav_timeout_secs)
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chrome_bin: None,
            profile_dir: PathBuf::from("cache/browser-profile"),
            nav_timeout_secs: 45,
            archive_first: true,
        }
    }
}

/// When the AI judge is consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyPolicy {
    #[default]
    Always,
    /// Only text coming from an alternative candidate.
    FallbackOnly,
    /// Only text shorter than `short_text_chars`.
    OnlyIfShort,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub policy: VerifyPolicy,
    pub min_confidence: f64,
    /// Treat a judge outage as an accepted-but-unverified pass.
    pub fail_open: bool,
    pub max_text_chars: usize,
    /// Used after the judge rejects the primary payload as too large.
    pub fallback_max_text_chars: usize,
    pub snippet_chars: usize,
    pub short_text_chars: usize,
    pub min_interval_ms: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            policy: VerifyPolicy::Always,
            min_confidence: 0.7,
            fail_open: false,
            max_text_chars: 6_000,
            fallback_max_text_chars: 2_500,
            snippet_chars: 600,
            short_text_chars: 1_500,
            min_interval_ms: 1_500,
            max_retries: 2,
            retry_base_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    pub date_tolerance_days: i64,
    pub min_trust_level: u8,
    /// Normalized Levenshtein similarity above which two titles from the same
    /// source are the same story.
    pub title_similarity: f64,
    pub max_candidates: usize,
    pub max_query_words: usize,
    pub news_search_url: String,
    pub hl: String,
    pub gl: String,
    pub ceid: String,
    pub search_min_interval_ms: u64,
    pub search_rate_limited_secs: u64,
    pub decode_min_interval_ms: u64,
    pub external_search: bool,
    pub external_search_url: String,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            date_tolerance_days: 3,
            min_trust_level: 0,
            title_similarity: 0.85,
            max_candidates: 10,
            max_query_words: 12,
            news_search_url: "https://news.google.com/rss/search".to_string(),
            hl: "en-US".to_string(),
            gl: "US".to_string(),
            ceid: "US:en".to_string(),
            search_min_interval_ms: 5_000,
            search_rate_limited_secs: 30 * 60,
            decode_min_interval_ms: 1_500,
            external_search: true,
            external_search_url: "https://html.duckduckgo.com/html/".to_string(),
        }
    }
}
