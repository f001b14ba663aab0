//! Alternative candidate discovery, filtering and ranking.
//!
//! Candidates come from the event's embedded related-articles list first,
//! then from search. [`CandidateEngine::classify`] turns the raw list into a
//! ranked queue plus a rejection log; [`CandidateEngine::resolve`] turns a
//! queued candidate into a fetchable URL.

pub mod authority;
pub mod links;
pub mod search;

use chrono::Duration as ChronoDuration;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strsim::normalized_levenshtein;
use tracing::{debug, info, instrument};

use crate::cache::normalize_url;
use crate::config::CandidateConfig;
use crate::cooldown::CooldownTracker;
use crate::fetchers::http::HttpGet;
use crate::models::{RawCandidate, TargetEvent, parse_loose_date};
use crate::utils::{bare_host, collapse_whitespace};

use authority::SourceAuthority;
use links::{LinkResolver, Resolution, parse_related_list};
use search::{ExternalSearch, GoogleNewsSearch, discover};

/// A candidate that passed the filters, with its derived ranking inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub raw: RawCandidate,
    pub domain: Option<String>,
    /// Canonical source name used for dedup.
    pub source_key: String,
    pub trust: u8,
}

impl Candidate {
    pub fn has_url(&self) -> bool {
        self.raw.url.is_some()
    }

    pub fn link(&self) -> Option<&str> {
        self.raw.link()
    }

    /// Name recorded as `text_source` when this candidate is accepted.
    pub fn source_name(&self) -> Option<&str> {
        self.raw.source.as_deref().or(self.domain.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SameSource,
    SameDomain,
    DateOutOfRange,
    BelowMinAgency,
    DomainCooldown,
    DuplicateCandidate,
    MissingLinkOrSource,
    Filtered,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SameSource => "same_source",
            RejectReason::SameDomain => "same_domain",
            RejectReason::DateOutOfRange => "date_out_of_range",
            RejectReason::BelowMinAgency => "below_min_agency",
            RejectReason::DomainCooldown => "domain_cooldown",
            RejectReason::DuplicateCandidate => "duplicate_candidate",
            RejectReason::MissingLinkOrSource => "missing_link_or_source",
            RejectReason::Filtered => "filtered",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub candidate: RawCandidate,
    pub reason: RejectReason,
}

/// What a candidate must not duplicate: the event's own links, domain and
/// source, plus anything already tried this run.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    urls: HashSet<String>,
    domains: HashSet<String>,
    sources: HashSet<String>,
}

impl Exclusions {
    pub fn for_event(event: &TargetEvent, authority: &SourceAuthority) -> Self {
        let mut out = Self::default();
        for link in [event.url.as_deref(), event.gn_url.as_deref()].into_iter().flatten() {
            out.add_url(link);
        }
        if let Some(domain) = event.domain() {
            if let Some(canon) = authority.canonical_for_domain(&domain) {
                out.sources.insert(canon);
            }
            out.domains.insert(domain);
        }
        if let Some(source) = event.source.as_deref() {
            let key = authority.canonical(source);
            if !key.is_empty() {
                out.sources.insert(key);
            }
        }
        out
    }

    pub fn add_url(&mut self, url: &str) {
        self.urls.insert(normalize_url(url));
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.urls.contains(&normalize_url(url))
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn contains_source(&self, source_key: &str) -> bool {
        self.sources.contains(source_key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Ranked queue, best first.
    pub accepted: Vec<Candidate>,
    pub rejected: Vec<Rejected>,
}

fn title_key(title: &str) -> String {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&cleaned)
}

#[derive(Debug)]
pub struct CandidateEngine<H> {
    config: CandidateConfig,
    authority: SourceAuthority,
    cooldowns: Arc<CooldownTracker>,
    news: GoogleNewsSearch<H>,
    external: Option<ExternalSearch<H>>,
    resolver: LinkResolver<H>,
}

impl<H: HttpGet + Clone> CandidateEngine<H> {
    pub fn new(
        http: H,
        config: CandidateConfig,
        authority: SourceAuthority,
        cooldowns: Arc<CooldownTracker>,
    ) -> Self {
        let external = config
            .external_search
            .then(|| ExternalSearch::new(http.clone(), cooldowns.clone(), &config));
        let resolver = LinkResolver::new(
            http.clone(),
            Duration::from_millis(config.decode_min_interval_ms),
            cooldowns.clone(),
            Duration::from_secs(config.search_rate_limited_secs),
        );
        Self {
            news: GoogleNewsSearch::new(http, cooldowns.clone(), config.clone()),
            external,
            resolver,
            config,
            authority,
            cooldowns,
        }
    }
}

impl<H: HttpGet> CandidateEngine<H> {
    pub fn exclusions(&self, event: &TargetEvent) -> Exclusions {
        Exclusions::for_event(event, &self.authority)
    }

    /// The related-articles list shipped with the event, followed by the one
    /// embedded in its feed description.
    pub fn embedded(&self, event: &TargetEvent) -> Vec<RawCandidate> {
        let mut out = event.related.clone();
        if let Some(description) = event.description.as_deref().filter(|d| d.contains("href")) {
            out.extend(parse_related_list(description));
        }
        for (rank, candidate) in out.iter_mut().enumerate() {
            candidate.rank = rank;
        }
        out
    }

    pub async fn search(&self, event: &TargetEvent) -> Vec<RawCandidate> {
        discover(event, &self.news, self.external.as_ref(), &self.config).await
    }

    pub async fn resolve(&self, candidate: &Candidate) -> Resolution {
        match (&candidate.raw.url, &candidate.raw.redirect) {
            (Some(url), _) => Resolution::Resolved(url.clone()),
            (None, Some(redirect)) => self.resolver.resolve(redirect).await,
            (None, None) => Resolution::Failed("candidate has no link".into()),
        }
    }

    /// Resolve a bare link, e.g. the event's own redirect.
    pub async fn resolve_link(&self, link: &str) -> Resolution {
        self.resolver.resolve(link).await
    }

    fn source_key(&self, raw: &RawCandidate, domain: Option<&str>) -> String {
        raw.source
            .as_deref()
            .map(|s| self.authority.canonical(s))
            .filter(|k| !k.is_empty())
            .or_else(|| domain.and_then(|d| self.authority.canonical_for_domain(d)))
            .or_else(|| domain.map(str::to_string))
            .unwrap_or_default()
    }

    fn filter_one(
        &self,
        event: &TargetEvent,
        raw: &RawCandidate,
        exclusions: &Exclusions,
    ) -> Result<Candidate, RejectReason> {
        let domain = raw.domain();
        let Some(link) = raw.link() else {
            return Err(RejectReason::MissingLinkOrSource);
        };

        if let Some(d) = domain.as_deref() {
            if self.cooldowns.is_cooling(d).is_some() {
                return Err(RejectReason::DomainCooldown);
            }
        }

        if let (Some(event_date), Some(date)) = (
            event.parsed_date(),
            raw.date.as_deref().and_then(parse_loose_date),
        ) {
            let tolerance = ChronoDuration::days(self.config.date_tolerance_days);
            if (date - event_date).abs() > tolerance {
                return Err(RejectReason::DateOutOfRange);
            }
        }

        let source_key = self.source_key(raw, domain.as_deref());
        if !source_key.is_empty() && exclusions.contains_source(&source_key) {
            return Err(RejectReason::SameSource);
        }
        if domain.as_deref().is_some_and(|d| exclusions.contains_domain(d)) {
            return Err(RejectReason::SameDomain);
        }
        if exclusions.contains_url(link) {
            return Err(RejectReason::DuplicateCandidate);
        }

        let trust = self.authority.level_for(raw.source.as_deref(), domain.as_deref());
        if trust < self.config.min_trust_level {
            return Err(RejectReason::BelowMinAgency);
        }

        Ok(Candidate {
            raw: raw.clone(),
            domain,
            source_key,
            trust,
        })
    }

    /// Filter, dedup and rank `raw` for `event`.
    ///
    /// Dedup keeps the first occurrence in discovery order. Survivors are then
    /// ranked by trust (desc), direct URL before redirect-only, then discovery
    /// rank, and cut at `max_candidates`.
    #[instrument(level = "info", skip_all, fields(event = %event.id, raw = raw.len()))]
    pub fn classify(&self, event: &TargetEvent, raw: Vec<RawCandidate>, exclusions: &Exclusions) -> Classification {
        let mut out = Classification::default();
        let mut passed = Vec::new();
        for candidate in raw {
            match self.filter_one(event, &candidate, exclusions) {
                Ok(c) => passed.push(c),
                Err(reason) => {
                    debug!(reason = reason.as_str(), link = ?candidate.link(), "Candidate rejected");
                    out.rejected.push(Rejected { candidate, reason });
                }
            }
        }

        let mut unique = Vec::with_capacity(passed.len());
        let mut links: HashSet<String> = HashSet::new();
        let mut outlets: HashSet<(String, String)> = HashSet::new();
        let mut titles: Vec<(String, String)> = Vec::new();
        for candidate in passed {
            let link_key = candidate.link().map(normalize_url).unwrap_or_default();
            let title = candidate.raw.title.as_deref().map(title_key).unwrap_or_default();
            let same_outlet = match &candidate.domain {
                Some(d) if !candidate.source_key.is_empty() => {
                    !outlets.insert((candidate.source_key.clone(), d.clone()))
                }
                _ => false,
            };
            let same_story = !title.is_empty()
                && !candidate.source_key.is_empty()
                && titles.iter().any(|(source, seen)| {
                    *source == candidate.source_key
                        && normalized_levenshtein(seen, &title) >= self.config.title_similarity
                });

            if !links.insert(link_key) || same_outlet || same_story {
                debug!(link = ?candidate.link(), "Duplicate candidate");
                out.rejected.push(Rejected {
                    candidate: candidate.raw,
                    reason: RejectReason::DuplicateCandidate,
                });
                continue;
            }
            if !title.is_empty() && !candidate.source_key.is_empty() {
                titles.push((candidate.source_key.clone(), title));
            }
            unique.push(candidate);
        }

        unique.sort_by(|a, b| {
            b.trust
                .cmp(&a.trust)
                .then_with(|| b.has_url().cmp(&a.has_url()))
                .then_with(|| a.raw.rank.cmp(&b.raw.rank))
        });

        for candidate in unique {
            if out.accepted.len() >= self.config.max_candidates {
                out.rejected.push(Rejected {
                    candidate: candidate.raw,
                    reason: RejectReason::Filtered,
                });
            } else {
                out.accepted.push(candidate);
            }
        }

        info!(
            accepted = out.accepted.len(),
            rejected = out.rejected.len(),
            "Classified candidates"
        );
        out
    }

    /// Re-check a candidate once its redirect is resolved; the publisher URL
    /// may reveal the event's own domain or one that is cooling down.
    pub fn recheck(&self, url: &str, exclusions: &Exclusions) -> Option<RejectReason> {
        let domain = bare_host(url)?;
        if exclusions.contains_url(url) {
            return Some(RejectReason::DuplicateCandidate);
        }
        if exclusions.contains_domain(&domain) {
            return Some(RejectReason::SameDomain);
        }
        if self
            .authority
            .canonical_for_domain(&domain)
            .is_some_and(|canon| exclusions.contains_source(&canon))
        {
            return Some(RejectReason::SameSource);
        }
        if self.cooldowns.is_cooling(url).is_some() {
            return Some(RejectReason::DomainCooldown);
        }
        None
    }
}
