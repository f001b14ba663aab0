//! Markup to article text.
//!
//! Passes, first acceptable wins:
//! 1. plain text (no tags at all), as returned by text-rendering proxies
//! 2. `application/ld+json` structured data (`articleBody`, `description`, `text`)
//! 3. article DOM selectors, paragraph-joined
//! 4. generic strip of the whole document
//!
//! A text is acceptable once it has at least `min_chars` characters.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::ExtractConfig;
use crate::utils::{char_len, collapse_whitespace};

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("valid regex"));
static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid regex"));
static NOSCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<noscript\b[^>]*>.*?</noscript\s*>").expect("valid regex"));
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static ANY_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

static LD_JSON: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).expect("valid selector"));
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").expect("valid selector"));

const ARTICLE_SELECTORS: &[&str] = &[
    "[itemprop=articleBody]",
    "article",
    "main",
    ".article-body",
    ".article__body",
    ".story-body",
    ".entry-content",
    ".post-content",
    "#article-body",
    ".content-body",
];

static ARTICLE: Lazy<Vec<Selector>> = Lazy::new(|| {
    ARTICLE_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});

const STRUCTURED_KEYS: &[&str] = &["articleBody", "description", "text"];

/// Result of running every pass over one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Accepted(String),
    /// Best text found, under the minimum.
    Short(String),
    Empty,
}

#[derive(Debug, Clone)]
pub struct TextExtractor {
    min_chars: usize,
    max_markup_bytes: usize,
}

impl TextExtractor {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            min_chars: config.min_chars,
            max_markup_bytes: config.max_markup_bytes,
        }
    }

    pub fn is_acceptable(&self, text: &str) -> bool {
        char_len(text) >= self.min_chars
    }

    /// Accepted text, or `None` when no pass clears the minimum.
    pub fn extract(&self, markup: &str) -> Option<String> {
        match self.classify(markup) {
            Extracted::Accepted(text) => Some(text),
            _ => None,
        }
    }

    #[instrument(level = "debug", skip_all, fields(bytes = markup.len()))]
    pub fn classify(&self, markup: &str) -> Extracted {
        let mut best = String::new();

        if markup.trim().is_empty() {
            return Extracted::Empty;
        }

        if !TAG_RE.is_match(markup) {
            let text = markup.trim().to_string();
            if self.is_acceptable(&text) {
                debug!(pass = "plain", "Extracted text");
                return Extracted::Accepted(text);
            }
            keep(text, &mut best);
            return self.finish(best);
        }

        if markup.len() <= self.max_markup_bytes {
            let document = Html::parse_document(markup);

            let structured = structured_texts(&document);
            if let Some(text) = self.longest_acceptable(structured.iter()) {
                debug!(pass = "structured", "Extracted text");
                return Extracted::Accepted(text);
            }
            for text in structured {
                keep(text, &mut best);
            }

            let dom: Vec<String> = ARTICLE
                .iter()
                .flat_map(|sel| document.select(sel))
                .map(paragraph_text)
                .collect();
            if let Some(text) = self.longest_acceptable(dom.iter()) {
                debug!(pass = "dom", "Extracted text");
                return Extracted::Accepted(text);
            }
            for text in dom {
                keep(text, &mut best);
            }
        } else {
            debug!(bytes = markup.len(), "Markup too large for structured passes");
        }

        let stripped = strip_markup(markup);
        if self.is_acceptable(&stripped) {
            debug!(pass = "strip", "Extracted text");
            return Extracted::Accepted(stripped);
        }
        keep(stripped, &mut best);
        self.finish(best)
    }

    fn finish(&self, best: String) -> Extracted {
        if best.trim().is_empty() {
            Extracted::Empty
        } else {
            Extracted::Short(best)
        }
    }

    fn longest_acceptable<'a>(&self, texts: impl Iterator<Item = &'a String>) -> Option<String> {
        texts
            .filter(|t| self.is_acceptable(t))
            .max_by_key(|t| char_len(t))
            .cloned()
    }
}

fn keep(text: String, best: &mut String) {
    if char_len(&text) > char_len(best) {
        *best = text;
    }
}

/// Every candidate string under the structured-data keys, depth first.
fn structured_texts(document: &Html) -> Vec<String> {
    let mut out = Vec::new();
    for script in document.select(&LD_JSON) {
        let raw: String = script.text().collect();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => collect_structured(&value, &mut out),
            Err(e) => debug!(error = %e, "Skipping unparseable ld+json block"),
        }
    }
    out
}

fn collect_structured(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_structured(v, out)),
        Value::Object(map) => {
            for key in STRUCTURED_KEYS {
                if let Some(Value::String(s)) = map.get(*key) {
                    let text = if TAG_RE.is_match(s) {
                        strip_markup(s)
                    } else {
                        collapse_whitespace(&html_escape::decode_html_entities(s))
                    };
                    if !text.is_empty() {
                        out.push(text);
                    }
                }
            }
            for (key, nested) in map {
                if matches!(nested, Value::Array(_) | Value::Object(_)) && key != "publisher" {
                    collect_structured(nested, out);
                }
            }
        }
        _ => {}
    }
}

/// Paragraph-joined text of an element, or its full text when it has no `<p>`.
fn paragraph_text(el: ElementRef<'_>) -> String {
    let paragraphs: Vec<String> = el
        .select(&PARAGRAPH)
        .map(|p| collapse_whitespace(&p.text().collect::<String>()))
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        collapse_whitespace(&el.text().collect::<String>())
    } else {
        paragraphs.join("\n\n")
    }
}

/// Drop non-content blocks and tags, decode entities, collapse whitespace.
pub fn strip_markup(markup: &str) -> String {
    let out = SCRIPT_RE.replace_all(markup, " ");
    let out = STYLE_RE.replace_all(&out, " ");
    let out = NOSCRIPT_RE.replace_all(&out, " ");
    let out = COMMENT_RE.replace_all(&out, " ");
    let out = ANY_TAG_RE.replace_all(&out, " ");
    collapse_whitespace(&html_escape::decode_html_entities(&out))
}
