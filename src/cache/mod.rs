//! Disk-backed article cache.
//!
//! Every URL maps to a content-address: the SHA-256 of the URL after tracking
//! parameters are stripped, the scheme is forced to `https` and the fragment
//! is dropped. Two files live under that address:
//!
//! ```text
//! cache_dir/
//! ├── <hash>.html   # raw markup
//! └── <hash>.txt    # extracted article text
//! ```
//!
//! Both start with the [`header`] block (`url`, `status`, `method`, `ts`,
//! `textLength`). Statuses `mismatch`, `short` and `blocked` are terminal for
//! that address; the orchestrator never retries it, though a different
//! candidate URL is still fair game.

pub mod header;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::utils::{char_len, truncate_bytes, truncate_chars};
use header::Header;

const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "yclid", "dclid", "gbraid", "wbraid", "msclkid", "mc_cid", "mc_eid",
    "igshid", "_ga", "_gl", "ref_src", "spm", "ocid", "cmpid", "guccounter",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheStatus {
    #[default]
    Unset,
    Ok,
    Mismatch,
    Short,
    Blocked,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Unset => "",
            CacheStatus::Ok => "ok",
            CacheStatus::Mismatch => "mismatch",
            CacheStatus::Short => "short",
            CacheStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "ok" => CacheStatus::Ok,
            "mismatch" => CacheStatus::Mismatch,
            "short" => CacheStatus::Short,
            "blocked" => CacheStatus::Blocked,
            _ => CacheStatus::Unset,
        }
    }
}

/// Provenance stored in each cache file header.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMeta {
    pub url: String,
    pub status: CacheStatus,
    pub method: Option<String>,
    pub ts: Option<DateTime<Utc>>,
    pub text_length: usize,
}

impl CacheMeta {
    pub fn new(url: &str, status: CacheStatus, method: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            status,
            method: method.map(str::to_string),
            ts: Some(Utc::now()),
            text_length: 0,
        }
    }

    fn to_header(&self, base: Option<&Header>) -> Header {
        let mut h = base.cloned().unwrap_or_default();
        h.set("url", self.url.as_str());
        h.set("status", self.status.as_str());
        h.set("method", self.method.clone().unwrap_or_default());
        h.set(
            "ts",
            self.ts.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );
        h.set("textLength", self.text_length.to_string());
        h.set("format", header::FORMAT_VERSION.to_string());
        h
    }

    fn from_header(h: &Header) -> Option<Self> {
        let url = h.get("url")?.to_string();
        Some(Self {
            url,
            status: CacheStatus::parse(h.get("status").unwrap_or_default()),
            method: h.get("method").filter(|m| !m.is_empty()).map(str::to_string),
            ts: h
                .get("ts")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            text_length: h.get("textLength").and_then(|n| n.parse().ok()).unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheProbe {
    /// Any file exists for the address.
    pub available: bool,
    /// The text file has a non-empty body.
    pub has_body: bool,
    pub meta: Option<CacheMeta>,
}

impl CacheProbe {
    /// Status that forbids another attempt on this address. `blocked`
    /// entries older than `blocked_ttl` are no longer terminal.
    pub fn terminal_status(&self, now: DateTime<Utc>, blocked_ttl: ChronoDuration) -> Option<CacheStatus> {
        let meta = self.meta.as_ref()?;
        match meta.status {
            CacheStatus::Mismatch | CacheStatus::Short => Some(meta.status),
            CacheStatus::Blocked => match meta.ts {
                Some(ts) if now - ts >= blocked_ttl => None,
                _ => Some(CacheStatus::Blocked),
            },
            CacheStatus::Ok | CacheStatus::Unset => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedBodies {
    pub markup: String,
    pub text: String,
    pub meta: Option<CacheMeta>,
}

#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
    max_text_chars: usize,
    max_markup_bytes: usize,
}

impl ContentCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            max_text_chars: config.max_text_chars,
            max_markup_bytes: config.max_markup_bytes,
        }
    }

    fn paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = content_address(url);
        (
            self.dir.join(format!("{key}.html")),
            self.dir.join(format!("{key}.txt")),
        )
    }

    /// Cheap existence and metadata check; never fails.
    #[instrument(level = "debug", skip(self))]
    pub async fn probe(&self, url: &str) -> CacheProbe {
        let (html_path, txt_path) = self.paths(url);
        let txt = read_optional(&txt_path).await;
        let html = read_optional(&html_path).await;

        let mut probe = CacheProbe {
            available: txt.is_some() || html.is_some(),
            ..Default::default()
        };
        if let Some(raw) = txt.as_deref() {
            let (h, body) = header::parse(raw);
            probe.has_body = !body.trim().is_empty();
            probe.meta = CacheMeta::from_header(&h);
        }
        if probe.meta.is_none() {
            if let Some(raw) = html.as_deref() {
                let (h, _) = header::parse(raw);
                probe.meta = CacheMeta::from_header(&h);
            }
        }
        debug!(available = probe.available, has_body = probe.has_body, "Cache probe");
        probe
    }

    /// Read both bodies. `Ok(None)` when nothing is cached for `url`.
    pub async fn read(&self, url: &str) -> Result<Option<CachedBodies>, CacheError> {
        let (html_path, txt_path) = self.paths(url);
        let txt = read_file(&txt_path).await?;
        let html = read_file(&html_path).await?;
        if txt.is_none() && html.is_none() {
            return Ok(None);
        }

        let (txt_header, text) = txt
            .as_deref()
            .map(header::parse)
            .map(|(h, b)| (Some(h), b.to_string()))
            .unwrap_or((None, String::new()));
        let markup = html
            .as_deref()
            .map(|raw| header::parse(raw).1.to_string())
            .unwrap_or_default();
        let meta = txt_header.as_ref().and_then(CacheMeta::from_header);

        Ok(Some(CachedBodies { markup, text, meta }))
    }

    /// Store both bodies under `url`'s address. Text and markup are capped
    /// before writing; the returned meta carries the stored text length.
    #[instrument(level = "debug", skip(self, markup, text, meta), fields(status = meta.status.as_str()))]
    pub async fn write(
        &self,
        url: &str,
        markup: &str,
        text: &str,
        meta: &CacheMeta,
    ) -> Result<CacheMeta, CacheError> {
        let text = truncate_chars(text, self.max_text_chars);
        let markup = truncate_bytes(markup, self.max_markup_bytes);
        let mut meta = meta.clone();
        meta.text_length = char_len(text);

        self.ensure_dir().await?;
        let (html_path, txt_path) = self.paths(url);
        let rendered = meta.to_header(None).render();
        write_atomic(&html_path, &format!("{rendered}{markup}")).await?;
        write_atomic(&txt_path, &format!("{rendered}{text}")).await?;
        debug!(text_length = meta.text_length, markup_bytes = markup.len(), "Cached bodies");
        Ok(meta)
    }

    /// Rewrite only the headers, keeping whatever bodies are already stored.
    #[instrument(level = "debug", skip(self, meta), fields(status = meta.status.as_str()))]
    pub async fn write_meta_only(&self, url: &str, meta: &CacheMeta) -> Result<(), CacheError> {
        self.ensure_dir().await?;
        let (html_path, txt_path) = self.paths(url);

        let existing_txt = read_file(&txt_path).await?;
        let existing_html = read_file(&html_path).await?;

        let (txt_header, text) = split_existing(existing_txt.as_deref());
        let (html_header, markup) = split_existing(existing_html.as_deref());

        let mut meta = meta.clone();
        if meta.text_length == 0 {
            meta.text_length = char_len(&text);
        }

        let txt_out = format!("{}{}", meta.to_header(txt_header.as_ref()).render(), text);
        let html_out = format!("{}{}", meta.to_header(html_header.as_ref()).render(), markup);
        write_atomic(&txt_path, &txt_out).await?;
        write_atomic(&html_path, &html_out).await?;
        Ok(())
    }

    async fn ensure_dir(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).await.map_err(|source| CacheError::Io {
            path: self.dir.display().to_string(),
            source,
        })
    }
}

fn split_existing(raw: Option<&str>) -> (Option<Header>, String) {
    match raw {
        Some(raw) => {
            let (h, body) = header::parse(raw);
            (Some(h), body.to_string())
        }
        None => (None, String::new()),
    }
}

/// URL with tracking parameters removed, scheme forced to https and the
/// fragment dropped. Unparseable input is returned trimmed.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    if url.scheme() == "http" {
        let _ = url.set_scheme("https");
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Hex SHA-256 of the normalized URL.
pub fn content_address(url: &str) -> String {
    let digest = Sha256::digest(normalize_url(url).as_bytes());
    hex::encode(digest)
}

async fn read_optional(path: &Path) -> Option<String> {
    match read_file(path).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Unreadable cache file; treating as absent");
            None
        }
    }
}

async fn read_file(path: &Path) -> Result<Option<String>, CacheError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CacheError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<(), CacheError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let io_err = |source: std::io::Error| CacheError::Io {
        path: path.display().to_string(),
        source,
    };
    fs::write(&tmp, contents).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
