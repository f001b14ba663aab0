//! Key/value header block at the top of every cache file.
//!
//! Layout:
//!
//! ```text
//! url: https://example.com/story
//! status: ok
//! method: fetch
//! ts: 2025-05-06T14:30:00Z
//! textLength: 1234
//! format: 1
//!
//! <body>
//! ```
//!
//! One `key: value` pair per line, terminated by the first empty line. Values
//! escape `\` as `\\`, LF as `\n` and CR as `\r`, so a value can never produce
//! the terminating empty line. Keys are ASCII without `:`. Unknown keys
//! survive a read/write cycle. Files without a `format` line are version 1.

pub const FORMAT_VERSION: u32 = 1;

/// Ordered header fields. Well-known keys are written first, in this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, String)>,
}

const KNOWN_ORDER: [&str; 6] = ["url", "status", "method", "ts", "textLength", "format"];

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn version(&self) -> u32 {
        self.get("format")
            .and_then(|v| v.parse().ok())
            .unwrap_or(FORMAT_VERSION)
    }

    /// Render the header followed by the blank separator line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let known = KNOWN_ORDER
            .iter()
            .filter_map(|key| self.fields.iter().find(|(k, _)| k == key));
        let rest = self
            .fields
            .iter()
            .filter(|(k, _)| !KNOWN_ORDER.contains(&k.as_str()));
        for (key, value) in known.chain(rest) {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&escape(value));
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Split a cache file into its header and body.
///
/// A file that does not start with a header line yields an empty header and
/// the whole input as body.
pub fn parse(raw: &str) -> (Header, &str) {
    let mut header = Header::new();
    let mut offset = 0;

    for line in raw.split_inclusive('\n') {
        let content = line.trim_end_matches('\n').trim_end_matches('\r');
        if content.is_empty() {
            offset += line.len();
            return (header, &raw[offset..]);
        }
        match content.split_once(':') {
            Some((key, value)) if is_key(key) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                header.set(key, unescape(value));
                offset += line.len();
            }
            _ => return (Header::new(), raw),
        }
    }

    // Header without body separator.
    if header.fields.is_empty() {
        (header, raw)
    } else {
        (header, "")
    }
}

fn is_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
