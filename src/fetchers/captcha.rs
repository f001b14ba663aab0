//! Captcha and bot-wall detection shared by the HTTP chain and the browser.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

static CAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(g-recaptcha|recaptcha/api|hcaptcha\.com|h-captcha|challenges\.cloudflare\.com|cf-chl-|challenge-platform|cf-turnstile|px-captcha|captcha-delivery\.com|verify you are human|are you a robot|unusual traffic from your computer|please complete the security check|press (and|&) hold)",
    )
    .expect("valid regex")
});

const WIDGET_SELECTORS: &[&str] = &[
    r#"iframe[src*="recaptcha"]"#,
    r#"iframe[src*="hcaptcha"]"#,
    r#"iframe[src*="challenges.cloudflare.com"]"#,
    ".g-recaptcha",
    ".h-captcha",
    ".cf-turnstile",
    "#challenge-form",
    "#px-captcha",
];

static WIDGETS: Lazy<Vec<Selector>> = Lazy::new(|| {
    WIDGET_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});

/// DOM probes only run on documents up to this size.
const DOM_PROBE_MAX_BYTES: usize = 512 * 1024;

/// Body keyword scan plus widget probes.
pub fn detect(markup: &str) -> bool {
    if CAPTCHA_RE.is_match(markup) {
        return true;
    }
    if markup.len() > DOM_PROBE_MAX_BYTES || !markup.contains('<') {
        return false;
    }
    let document = Html::parse_document(markup);
    WIDGETS.iter().any(|sel| document.select(sel).next().is_some())
}
