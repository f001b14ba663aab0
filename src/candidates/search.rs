//! Candidate discovery through search.
//!
//! [`GoogleNewsSearch`] queries the Google News RSS endpoint. When it is
//! cooling down or finds nothing, [`ExternalSearch`] scrapes the DuckDuckGo
//! HTML endpoint instead. Both return results in rank order.

use chrono::Duration as ChronoDuration;
use itertools::Itertools;
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::CandidateConfig;
use crate::cooldown::CooldownTracker;
use crate::error::SearchError;
use crate::fetchers::http::HttpGet;
use crate::models::{CandidateOrigin, RawCandidate, TargetEvent};
use crate::rate_limit::RateLimiter;
use crate::utils::{bare_host, collapse_whitespace, normalize_source};

use super::links::is_news_redirect;

static RESULT_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a.result__a").expect("valid selector"));

/// Drop a trailing `" - Publisher"` that aggregators append to headlines.
pub fn strip_source_suffix<'a>(title: &'a str, source: Option<&str>) -> &'a str {
    let Some((head, tail)) = title.rsplit_once(" - ") else {
        return title.trim();
    };
    let tail_words = tail.split_whitespace().count();
    let matches_source = source.is_some_and(|s| normalize_source(s) == normalize_source(tail));
    if matches_source || (tail_words <= 4 && !head.trim().is_empty()) {
        head.trim()
    } else {
        title.trim()
    }
}

fn query_words(text: &str, max_words: usize) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '%' || c == '$' { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().take(max_words).join(" ")
}

/// Search query variants for `event`, most specific first: the headline, a
/// keyword-only query and the alternate-language headline. Date operators
/// bound every variant when the event date is known.
pub fn build_queries(event: &TargetEvent, config: &CandidateConfig) -> Vec<String> {
    let source = event.source.as_deref();
    let mut bases = Vec::new();
    if let Some(title) = event.title_en.as_deref().filter(|t| !t.trim().is_empty()) {
        bases.push(query_words(strip_source_suffix(title, source), config.max_query_words));
    }
    if !event.keywords.is_empty() {
        bases.push(query_words(&event.keywords.join(" "), config.max_query_words));
    }
    if let Some(title) = event.title_ru.as_deref().filter(|t| !t.trim().is_empty()) {
        bases.push(query_words(strip_source_suffix(title, source), config.max_query_words));
    }

    let operators = event.parsed_date().map(|d| {
        let tolerance = ChronoDuration::days(config.date_tolerance_days);
        format!(
            "after:{} before:{}",
            (d - tolerance).format("%Y-%m-%d"),
            (d + tolerance + ChronoDuration::days(1)).format("%Y-%m-%d")
        )
    });

    bases
        .into_iter()
        .filter(|q| !q.is_empty())
        .unique()
        .map(|q| match &operators {
            Some(ops) => format!("{q} {ops}"),
            None => q,
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    source: Option<ItemSource>,
}

#[derive(Debug, Deserialize)]
struct ItemSource {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "$text")]
    name: Option<String>,
}

/// Parse a Google News RSS document into rank-ordered candidates.
pub fn parse_news_rss(xml: &str) -> Result<Vec<RawCandidate>, SearchError> {
    let rss: Rss = from_str(xml).map_err(|e| SearchError::Parse(e.to_string()))?;
    let out = rss
        .channel
        .items
        .into_iter()
        .enumerate()
        .filter_map(|(rank, item)| {
            let link = item.link?.trim().to_string();
            let (source, source_url) = item
                .source
                .map(|s| (s.name.map(|n| collapse_whitespace(&n)), s.url))
                .unwrap_or((None, None));
            let title = item
                .title
                .map(|t| strip_source_suffix(&t, source.as_deref()).to_string());
            let redirect = is_news_redirect(&link);
            Some(RawCandidate {
                title,
                url: (!redirect).then(|| link.clone()),
                redirect: redirect.then_some(link),
                source,
                source_url,
                date: item.pub_date,
                rank,
                origin: CandidateOrigin::NewsSearch,
            })
        })
        .collect();
    Ok(out)
}

#[derive(Debug)]
pub struct GoogleNewsSearch<H> {
    http: H,
    limiter: RateLimiter,
    cooldowns: Arc<CooldownTracker>,
    config: CandidateConfig,
}

impl<H: HttpGet> GoogleNewsSearch<H> {
    pub fn new(http: H, cooldowns: Arc<CooldownTracker>, config: CandidateConfig) -> Self {
        Self {
            http,
            limiter: RateLimiter::new("news-search", Duration::from_millis(config.search_min_interval_ms)),
            cooldowns,
            config,
        }
    }

    fn query_url(&self, query: &str) -> String {
        format!(
            "{}?q={}&hl={}&gl={}&ceid={}",
            self.config.news_search_url,
            urlencoding::encode(query),
            urlencoding::encode(&self.config.hl),
            urlencoding::encode(&self.config.gl),
            urlencoding::encode(&self.config.ceid),
        )
    }

    #[instrument(level = "info", skip(self))]
    pub async fn search(&self, query: &str) -> Result<Vec<RawCandidate>, SearchError> {
        let url = self.query_url(query);
        if let Some(hit) = self.cooldowns.is_in_cooldown(&url) {
            return Err(SearchError::CoolingDown(hit.reason));
        }
        self.limiter.acquire().await;

        let resp = self.http.get(&url).await?;
        if matches!(resp.status, 429 | 503) {
            let pause = Duration::from_secs(self.config.search_rate_limited_secs);
            self.cooldowns
                .set_cooldown(&url, pause, &format!("news search {}", resp.status));
            self.limiter.back_off(pause).await;
            return Err(SearchError::Status(resp.status));
        }
        if !resp.is_success() {
            return Err(SearchError::Status(resp.status));
        }
        let results = parse_news_rss(&resp.body)?;
        info!(count = results.len(), "News search results");
        Ok(results)
    }
}

/// Publisher URL behind a DuckDuckGo result link.
fn unwrap_result_link(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;
    if parsed.host_str().is_some_and(|h| h.ends_with("duckduckgo.com")) {
        let target = parsed
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned())?;
        return Url::parse(&target).ok().map(|u| u.to_string());
    }
    Some(parsed.to_string())
}

pub fn parse_external_results(html: &str) -> Vec<RawCandidate> {
    let document = Html::parse_document(html);
    document
        .select(&RESULT_LINK)
        .filter_map(|a| {
            let url = unwrap_result_link(a.value().attr("href")?)?;
            let title = collapse_whitespace(&a.text().collect::<String>());
            Some((url, title))
        })
        .unique_by(|(url, _)| url.clone())
        .enumerate()
        .map(|(rank, (url, title))| RawCandidate {
            title: (!title.is_empty()).then_some(title),
            source_url: bare_host(&url).map(|h| format!("https://{h}")),
            url: Some(url),
            rank,
            origin: CandidateOrigin::ExternalSearch,
            ..Default::default()
        })
        .collect()
}

#[derive(Debug)]
pub struct ExternalSearch<H> {
    http: H,
    cooldowns: Arc<CooldownTracker>,
    base_url: String,
    rate_limited: Duration,
}

impl<H: HttpGet> ExternalSearch<H> {
    pub fn new(http: H, cooldowns: Arc<CooldownTracker>, config: &CandidateConfig) -> Self {
        Self {
            http,
            cooldowns,
            base_url: config.external_search_url.clone(),
            rate_limited: Duration::from_secs(config.search_rate_limited_secs),
        }
    }

    #[instrument(level = "info", skip(self))]
    pub async fn search(&self, query: &str) -> Result<Vec<RawCandidate>, SearchError> {
        let url = format!("{}?q={}", self.base_url, urlencoding::encode(query));
        if let Some(hit) = self.cooldowns.is_in_cooldown(&url) {
            return Err(SearchError::CoolingDown(hit.reason));
        }
        let resp = self.http.get(&url).await?;
        if matches!(resp.status, 403 | 429 | 503) {
            self.cooldowns
                .set_cooldown(&url, self.rate_limited, &format!("external search {}", resp.status));
            return Err(SearchError::Status(resp.status));
        }
        if !resp.is_success() {
            return Err(SearchError::Status(resp.status));
        }
        let results = parse_external_results(&resp.body);
        debug!(count = results.len(), "External search results");
        Ok(results)
    }
}

/// Run every query variant against news search, falling back to external
/// search when news search is cooling down or returns nothing.
#[instrument(level = "info", skip_all, fields(event = %event.id))]
pub async fn discover<H: HttpGet>(
    event: &TargetEvent,
    news: &GoogleNewsSearch<H>,
    external: Option<&ExternalSearch<H>>,
    config: &CandidateConfig,
) -> Vec<RawCandidate> {
    let queries = build_queries(event, config);
    let mut found = Vec::new();
    let mut news_unavailable = false;

    for query in &queries {
        match news.search(query).await {
            Ok(results) => found.extend(results),
            Err(e) => {
                warn!(error = %e, %query, "News search failed");
                if matches!(e, SearchError::CoolingDown(_) | SearchError::Status(429 | 503)) {
                    news_unavailable = true;
                    break;
                }
            }
        }
        if found.len() >= config.max_candidates {
            break;
        }
    }

    if found.is_empty() || news_unavailable {
        if let Some(external) = external {
            info!(news_unavailable, "Falling back to external search");
            for query in &queries {
                match external.search(query).await {
                    Ok(results) if !results.is_empty() => {
                        found.extend(results);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, %query, "External search failed");
                        break;
                    }
                }
            }
        }
    }

    // Ranks restart per query; re-number in discovery order.
    for (rank, candidate) in found.iter_mut().enumerate() {
        candidate.rank = rank;
    }
    found
}
