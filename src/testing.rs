//! Hand-written doubles for the network, browser and judge seams.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::api::AskAsync;
use crate::error::{BrowserError, HttpError, JudgeError};
use crate::fetchers::browser::BrowserSession;
use crate::fetchers::http::{HttpGet, HttpResponse};

#[derive(Debug, Clone)]
enum Reply {
    Response(HttpResponse),
    Timeout,
}

#[derive(Debug, Default)]
struct HttpState {
    exact: HashMap<String, VecDeque<Reply>>,
    prefixes: Vec<(String, Reply)>,
    calls: Vec<String>,
}

/// Route table keyed by exact URL, with prefix fallbacks. Unknown URLs get a
/// 404. A queued route replays its last reply once the queue is down to one.
#[derive(Debug, Clone, Default)]
pub struct MockHttp {
    state: Arc<Mutex<HttpState>>,
}

impl MockHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, status: u16, body: &str) -> &Self {
        self.push(url, Reply::Response(response(url, status, body)))
    }

    pub fn redirect(&self, url: &str, final_url: &str, body: &str) -> &Self {
        self.push(url, Reply::Response(response(final_url, 200, body)))
    }

    pub fn timeout(&self, url: &str) -> &Self {
        self.push(url, Reply::Timeout)
    }

    pub fn route_prefix(&self, prefix: &str, status: u16, body: &str) -> &Self {
        let mut state = self.state.lock().unwrap();
        state
            .prefixes
            .push((prefix.to_string(), Reply::Response(response(prefix, status, body))));
        self
    }

    fn push(&self, url: &str, reply: Reply) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.exact.entry(url.to_string()).or_default().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn called(&self, url: &str) -> bool {
        self.calls().iter().any(|c| c == url)
    }

    pub fn count(&self, url: &str) -> usize {
        self.calls().iter().filter(|c| *c == url).count()
    }

    /// Calls whose URL starts with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

fn response(final_url: &str, status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        final_url: final_url.to_string(),
        body: body.to_string(),
    }
}

impl HttpGet for MockHttp {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(url.to_string());
            let exact = state.exact.get_mut(url).and_then(|queue| {
                if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() }
            });
            exact.or_else(|| {
                state
                    .prefixes
                    .iter()
                    .filter(|(p, _)| url.starts_with(p.as_str()))
                    .max_by_key(|(p, _)| p.len())
                    .map(|(_, r)| r.clone())
            })
        };
        match reply {
            Some(Reply::Response(mut resp)) => {
                if resp.final_url.is_empty() || url.starts_with(&resp.final_url) {
                    resp.final_url = url.to_string();
                }
                Ok(resp)
            }
            Some(Reply::Timeout) => Err(HttpError::Timeout),
            None => Ok(response(url, 404, "")),
        }
    }
}

#[derive(Debug, Clone)]
enum Page {
    Html(String),
    Timeout,
    Closed,
}

#[derive(Debug, Default)]
struct BrowserState {
    pages: HashMap<String, Page>,
    calls: Vec<String>,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockBrowser {
    state: Arc<Mutex<BrowserState>>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, html: &str) -> &Self {
        self.insert(url, Page::Html(html.to_string()))
    }

    pub fn timeout(&self, url: &str) -> &Self {
        self.insert(url, Page::Timeout)
    }

    pub fn crash_on(&self, url: &str) -> &Self {
        self.insert(url, Page::Closed)
    }

    fn insert(&self, url: &str, page: Page) -> &Self {
        self.state.lock().unwrap().pages.insert(url.to_string(), page);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl BrowserSession for MockBrowser {
    async fn render(&self, url: &str) -> Result<String, BrowserError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BrowserError::Closed("session already closed".into()));
        }
        state.calls.push(url.to_string());
        match state.pages.get(url).cloned() {
            Some(Page::Html(html)) => Ok(html),
            Some(Page::Timeout) => Err(BrowserError::Timeout),
            Some(Page::Closed) => {
                state.closed = true;
                Err(BrowserError::Closed("target crashed".into()))
            }
            None => Ok("<html><body></body></html>".to_string()),
        }
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

type Responder = dyn Fn(&str) -> Result<String, JudgeError> + Send + Sync;

/// Judge driven by a closure over the request payload.
#[derive(Clone)]
pub struct MockJudge {
    responder: Arc<Responder>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl fmt::Debug for MockJudge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockJudge").finish_non_exhaustive()
    }
}

impl MockJudge {
    pub fn new(responder: impl Fn(&str) -> Result<String, JudgeError> + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answers with the same verdict.
    pub fn verdict(is_match: bool, confidence: f64) -> Self {
        Self::new(move |_| Ok(verdict_json(is_match, confidence)))
    }

    /// Matches only payloads whose candidate URL contains `needle`.
    pub fn matching_url(needle: &'static str) -> Self {
        Self::new(move |payload| {
            let value: serde_json::Value = serde_json::from_str(payload).unwrap();
            let url = value["candidate"]["url"].as_str().unwrap_or_default();
            Ok(verdict_json(url.contains(needle), 0.9))
        })
    }

    pub fn failing() -> Self {
        Self::new(|_| Err(JudgeError::Failed("provider down".into())))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn verdict_json(is_match: bool, confidence: f64) -> String {
    serde_json::json!({
        "match": is_match,
        "confidence": confidence,
        "reason": if is_match { "same event" } else { "different event" },
        "page_summary": "summary",
    })
    .to_string()
}

impl AskAsync for MockJudge {
    type Response = String;

    async fn ask(&self, text: &str) -> Result<String, JudgeError> {
        self.calls.lock().unwrap().push(text.to_string());
        (self.responder)(text)
    }
}

/// Article-sized filler text.
pub fn article_text(words: usize) -> String {
    (0..words)
        .map(|i| format!("word{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Markup whose extracted text is `article_text(words)`.
pub fn article_html(words: usize) -> String {
    format!("<html><body><article><p>{}</p></article></body></html>", article_text(words))
}
