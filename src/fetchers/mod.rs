//! Network acquisition strategies.
//!
//! - [`mirrors::MirrorChain`]: direct GET, text proxy, archive mirrors, web archive
//! - [`browser::BrowserAcquirer`]: headless browser, last resort
//!
//! Both turn whatever markup they obtain into a [`FetchAttempt`] through
//! [`page_attempt`], so a page means the same thing regardless of where it
//! came from.

pub mod browser;
pub mod captcha;
pub mod http;
pub mod mirrors;

use crate::extract::{Extracted, TextExtractor};
use crate::models::{FetchAttempt, FetchedPage, Method};

/// Classify fetched markup. Captcha markers only count when the page did not
/// yield acceptable text, since many article pages embed a captcha script for
/// their comment forms.
pub fn page_attempt(extractor: &TextExtractor, html: String, method: Method) -> FetchAttempt {
    match extractor.classify(&html) {
        Extracted::Accepted(text) => FetchAttempt::Success(FetchedPage { html, text, method }),
        _ if captcha::detect(&html) => FetchAttempt::Captcha,
        Extracted::Short(text) => FetchAttempt::Short(FetchedPage { html, text, method }),
        Extracted::Empty => FetchAttempt::NoText,
    }
}

/// Keep the most informative failure seen across strategies.
pub(crate) fn worse(current: FetchAttempt, next: FetchAttempt) -> FetchAttempt {
    fn weight(a: &FetchAttempt) -> u8 {
        match a {
            FetchAttempt::Captcha => 4,
            FetchAttempt::Blocked { .. } => 3,
            FetchAttempt::Timeout => 2,
            FetchAttempt::NoText => 1,
            FetchAttempt::Success(_) | FetchAttempt::Short(_) => 0,
        }
    }
    if weight(&next) >= weight(&current) { next } else { current }
}
