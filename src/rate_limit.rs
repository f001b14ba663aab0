//! Minimum-spacing limiter shared by AI calls, news-search queries and
//! redirect decoding.
//!
//! Each limiter keeps a single "not before" instant. A caller waits it out,
//! then pushes it `interval` into the future. Callers are serialized by the
//! lock, so bursts become evenly spaced requests.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    interval: Duration,
    not_before: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            not_before: Mutex::new(None),
        }
    }

    /// Wait for the next free slot and reserve it.
    pub async fn acquire(&self) {
        let mut not_before = self.not_before.lock().await;
        if let Some(at) = *not_before {
            let now = Instant::now();
            if at > now {
                debug!(limiter = self.name, wait_ms = (at - now).as_millis() as u64, "Waiting for rate limit slot");
                sleep_until(at).await;
            }
        }
        *not_before = Some(Instant::now() + self.interval);
    }

    /// Push the next slot further out, e.g. after the remote side answered 429.
    pub async fn back_off(&self, extra: Duration) {
        let mut not_before = self.not_before.lock().await;
        let candidate = Instant::now() + extra;
        *not_before = Some(match *not_before {
            Some(at) if at > candidate => at,
            _ => candidate,
        });
        debug!(limiter = self.name, extra_ms = extra.as_millis() as u64, "Rate limiter backed off");
    }
}
