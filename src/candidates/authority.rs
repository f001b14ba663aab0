//! Source authority ("agency level") table.
//!
//! Levels run from 0 (unknown) to 5 (global wire service). Lookup order:
//! alias → exact name → publisher domain → whole-word match inside the name →
//! `default_level`. Names are compared after [`normalize_source`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils::{bare_host, normalize_source};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceAuthority {
    pub default_level: u8,
    /// Canonical source name → level.
    pub levels: HashMap<String, u8>,
    /// Alternative spelling → canonical source name.
    pub aliases: HashMap<String, String>,
    /// Publisher host → canonical source name.
    pub domains: HashMap<String, String>,
}

impl Default for SourceAuthority {
    fn default() -> Self {
        Self::seed()
    }
}

impl SourceAuthority {
    /// Built-in table of wire services and major outlets.
    pub fn seed() -> Self {
        let levels = [
            ("reuters", 5),
            ("associated press", 5),
            ("bloomberg", 5),
            ("agence france presse", 5),
            ("bbc news", 4),
            ("financial times", 4),
            ("wall street journal", 4),
            ("new york times", 4),
            ("guardian", 4),
            ("washington post", 4),
            ("economist", 4),
            ("tass", 4),
            ("interfax", 4),
            ("ria novosti", 3),
            ("kommersant", 3),
            ("vedomosti", 3),
            ("rbc", 3),
            ("cnn", 3),
            ("cnbc", 3),
            ("al jazeera", 3),
            ("politico", 3),
            ("axios", 3),
            ("npr", 3),
            ("deutsche welle", 3),
            ("france 24", 3),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let aliases = [
            ("ap", "associated press"),
            ("ap news", "associated press"),
            ("afp", "agence france presse"),
            ("bbc", "bbc news"),
            ("ft", "financial times"),
            ("wsj", "wall street journal"),
            ("nyt", "new york times"),
            ("nytimes", "new york times"),
            ("guardian news", "guardian"),
            ("dw", "deutsche welle"),
            ("ria", "ria novosti"),
            ("rbc ru", "rbc"),
            ("bloomberg news", "bloomberg"),
            ("reuters com", "reuters"),
        ]
        .into_iter()
        .map(|(a, c)| (a.to_string(), c.to_string()))
        .collect();

        let domains = [
            ("reuters.com", "reuters"),
            ("apnews.com", "associated press"),
            ("bloomberg.com", "bloomberg"),
            ("afp.com", "agence france presse"),
            ("bbc.com", "bbc news"),
            ("bbc.co.uk", "bbc news"),
            ("ft.com", "financial times"),
            ("wsj.com", "wall street journal"),
            ("nytimes.com", "new york times"),
            ("theguardian.com", "guardian"),
            ("washingtonpost.com", "washington post"),
            ("economist.com", "economist"),
            ("tass.com", "tass"),
            ("tass.ru", "tass"),
            ("interfax.ru", "interfax"),
            ("interfax.com", "interfax"),
            ("ria.ru", "ria novosti"),
            ("kommersant.ru", "kommersant"),
            ("vedomosti.ru", "vedomosti"),
            ("rbc.ru", "rbc"),
            ("cnn.com", "cnn"),
            ("cnbc.com", "cnbc"),
            ("aljazeera.com", "al jazeera"),
            ("politico.com", "politico"),
            ("axios.com", "axios"),
            ("npr.org", "npr"),
            ("dw.com", "deutsche welle"),
            ("france24.com", "france 24"),
        ]
        .into_iter()
        .map(|(d, c)| (d.to_string(), c.to_string()))
        .collect();

        Self {
            default_level: 1,
            levels,
            aliases,
            domains,
        }
    }

    /// Canonical name for `source`, or its normalized form when unknown.
    pub fn canonical(&self, source: &str) -> String {
        let s = normalize_source(source);
        self.aliases
            .iter()
            .find(|(alias, _)| normalize_source(alias) == s)
            .map(|(_, canon)| normalize_source(canon))
            .unwrap_or(s)
    }

    /// Canonical name for a publisher host, walking up parent domains.
    pub fn canonical_for_domain(&self, domain: &str) -> Option<String> {
        let host = bare_host(domain)?;
        let mut candidate = host.as_str();
        loop {
            if let Some(canon) = self.domains.get(candidate) {
                return Some(normalize_source(canon));
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return None,
            }
        }
    }

    fn level_of(&self, canonical: &str) -> Option<u8> {
        self.levels
            .iter()
            .find(|(name, _)| normalize_source(name) == canonical)
            .map(|(_, level)| *level)
    }

    pub fn level_for(&self, source: Option<&str>, domain: Option<&str>) -> u8 {
        let canonical = source.map(|s| self.canonical(s)).filter(|s| !s.is_empty());

        if let Some(level) = canonical.as_deref().and_then(|c| self.level_of(c)) {
            return level;
        }
        if let Some(level) = domain
            .and_then(|d| self.canonical_for_domain(d))
            .and_then(|c| self.level_of(&c))
        {
            return level;
        }
        if let Some(name) = canonical {
            let padded = format!(" {name} ");
            let best = self
                .levels
                .iter()
                .filter(|(key, _)| padded.contains(&format!(" {} ", normalize_source(key))))
                .map(|(_, level)| *level)
                .max();
            if let Some(level) = best {
                return level;
            }
        }
        self.default_level
    }
}
