//! Google News redirect links: the embedded related-articles list and
//! decoding a redirect into the publisher URL.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cooldown::CooldownTracker;
use crate::error::HttpError;
use crate::fetchers::http::HttpGet;
use crate::models::{CandidateOrigin, RawCandidate};
use crate::rate_limit::RateLimiter;
use crate::utils::{bare_host, collapse_whitespace};

pub const NEWS_HOST: &str = "news.google.com";

const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static DATA_N_AU: Lazy<Regex> = Lazy::new(|| Regex::new(r#"data-n-au="([^"]+)""#).expect("valid regex"));
static LIST_ITEM: Lazy<Selector> = Lazy::new(|| Selector::parse("li").expect("valid selector"));
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("valid selector"));
static FONT: Lazy<Selector> = Lazy::new(|| Selector::parse("font").expect("valid selector"));

/// Outcome of turning a candidate link into a fetchable article URL.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(String),
    /// The resolver is rate limited; try again after the other candidates.
    Deferred,
    Failed(String),
}

/// Whether `url` is an aggregator redirect rather than a publisher URL.
pub fn is_news_redirect(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    parsed.host_str() == Some(NEWS_HOST)
        && (parsed.path().contains("/articles/") || parsed.path().contains("/read/"))
}

/// Decode the publisher URL embedded in the article id, when the id uses the
/// older self-contained encoding.
pub fn decode_offline(redirect: &str) -> Option<String> {
    let parsed = Url::parse(redirect).ok()?;
    let id = parsed.path_segments()?.next_back()?;
    let bytes = LENIENT_URL_SAFE.decode(id.trim_end_matches('=')).ok()?;
    let start = bytes.windows(4).position(|w| w == b"http")?;
    let tail: Vec<u8> = bytes[start..]
        .iter()
        .take_while(|b| (0x21..0x7f).contains(*b))
        .copied()
        .collect();
    let candidate = String::from_utf8(tail).ok()?;
    let url = Url::parse(&candidate).ok()?;
    (url.host_str().is_some() && url.host_str() != Some(NEWS_HOST)).then(|| url.to_string())
}

/// Parse the related-coverage list from a Google News RSS item description.
///
/// The description is either an `<ol>` of `<li><a>title</a><font>source</font></li>`
/// or a single anchor/font pair.
pub fn parse_related_list(description_html: &str) -> Vec<RawCandidate> {
    let fragment = Html::parse_fragment(description_html);
    let items: Vec<_> = fragment.select(&LIST_ITEM).collect();

    let parse_item = |el: scraper::ElementRef<'_>| -> Option<(String, String, Option<String>)> {
        let anchor = el.select(&ANCHOR).next()?;
        let href = anchor.value().attr("href")?.trim().to_string();
        let title = collapse_whitespace(&anchor.text().collect::<String>());
        let source = el
            .select(&FONT)
            .next()
            .map(|f| collapse_whitespace(&f.text().collect::<String>()))
            .filter(|s| !s.is_empty());
        Some((href, title, source))
    };

    let parsed: Vec<_> = if items.is_empty() {
        parse_item(fragment.root_element()).into_iter().collect()
    } else {
        items.into_iter().filter_map(parse_item).collect()
    };

    parsed
        .into_iter()
        .enumerate()
        .map(|(rank, (href, title, source))| {
            let redirect = is_news_redirect(&href);
            RawCandidate {
                title: (!title.is_empty()).then_some(title),
                url: (!redirect).then(|| href.clone()),
                redirect: redirect.then_some(href),
                source,
                source_url: None,
                date: None,
                rank,
                origin: CandidateOrigin::Embedded,
            }
        })
        .collect()
}

/// Resolves redirect links, offline first, then over HTTP at a bounded rate.
#[derive(Debug)]
pub struct LinkResolver<H> {
    http: H,
    limiter: RateLimiter,
    cooldowns: Arc<CooldownTracker>,
    rate_limited: Duration,
}

impl<H: HttpGet> LinkResolver<H> {
    pub fn new(http: H, min_interval: Duration, cooldowns: Arc<CooldownTracker>, rate_limited: Duration) -> Self {
        Self {
            http,
            limiter: RateLimiter::new("redirect-decode", min_interval),
            cooldowns,
            rate_limited,
        }
    }

    #[instrument(level = "info", skip(self))]
    pub async fn resolve(&self, link: &str) -> Resolution {
        if !is_news_redirect(link) {
            return Resolution::Resolved(link.to_string());
        }
        if let Some(url) = decode_offline(link) {
            debug!(%url, "Decoded redirect offline");
            return Resolution::Resolved(url);
        }
        if let Some(hit) = self.cooldowns.is_in_cooldown(link) {
            info!(remaining_secs = hit.remaining.as_secs(), "Redirect resolver cooling down; deferring");
            return Resolution::Deferred;
        }

        self.limiter.acquire().await;
        match self.http.get(link).await {
            Ok(resp) if resp.status == 429 => {
                self.cooldowns.set_cooldown(link, self.rate_limited, "429 on redirect decode");
                self.limiter.back_off(self.rate_limited).await;
                Resolution::Deferred
            }
            Ok(resp) if resp.is_success() => {
                if bare_host(&resp.final_url).as_deref() != Some(NEWS_HOST) {
                    return Resolution::Resolved(resp.final_url);
                }
                match DATA_N_AU.captures(&resp.body).map(|c| html_escape::decode_html_entities(&c[1]).to_string()) {
                    Some(url) => Resolution::Resolved(url),
                    None => Resolution::Failed("redirect page has no target".into()),
                }
            }
            Ok(resp) => Resolution::Failed(format!("redirect decode returned {}", resp.status)),
            Err(HttpError::Timeout) => Resolution::Deferred,
            Err(e) => {
                warn!(error = %e, "Redirect decode failed");
                Resolution::Failed(e.to_string())
            }
        }
    }
}
