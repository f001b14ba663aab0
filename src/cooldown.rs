//! Per-host backpressure ledger.
//!
//! A host that answered with a block signal (captcha, 401/403/429/5xx,
//! timeout) is left alone until its cooldown expires. Hosts are keyed by bare
//! hostname, so `www.example.com` and `example.com` share one record.
//!
//! Cooldowns only ever grow while active: setting a shorter one on a host
//! that is already cooling down keeps the later expiry. Long cooldowns can
//! optionally let one probe request through per `probe_interval` so a host
//! that recovers early is noticed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::CooldownConfig;
use crate::utils::bare_host;

#[derive(Debug, Clone, PartialEq)]
pub struct CooldownRecord {
    pub host: String,
    pub until: Instant,
    pub set_at: Instant,
    pub reason: String,
    pub last_probe: Option<Instant>,
}

/// An active cooldown as seen by a caller about to contact `host`.
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownHit {
    pub host: String,
    pub remaining: Duration,
    pub reason: String,
}

#[derive(Debug)]
pub struct CooldownTracker {
    records: Mutex<HashMap<String, CooldownRecord>>,
    probe_interval: Option<Duration>,
    probe_min_cooldown: Duration,
}

impl CooldownTracker {
    pub fn new(probe_interval: Option<Duration>, probe_min_cooldown: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            probe_interval,
            probe_min_cooldown,
        }
    }

    pub fn from_config(config: &CooldownConfig) -> Self {
        Self::new(
            config.probe_interval_secs.map(Duration::from_secs),
            Duration::from_secs(config.probe_min_cooldown_secs),
        )
    }

    pub fn is_in_cooldown(&self, url: &str) -> Option<CooldownHit> {
        self.is_in_cooldown_at(url, Instant::now())
    }

    /// Check `url`'s host at `now` before contacting it. Expired records are
    /// evicted. A due probe is let through and recorded.
    pub fn is_in_cooldown_at(&self, url: &str, now: Instant) -> Option<CooldownHit> {
        self.check_at(url, now, true)
    }

    pub fn is_cooling(&self, url: &str) -> Option<CooldownHit> {
        self.is_cooling_at(url, Instant::now())
    }

    /// Like [`Self::is_in_cooldown_at`] but leaves the ledger untouched: a due
    /// probe reports the host as open without using up the probe.
    pub fn is_cooling_at(&self, url: &str, now: Instant) -> Option<CooldownHit> {
        self.check_at(url, now, false)
    }

    fn check_at(&self, url: &str, now: Instant, take_probe: bool) -> Option<CooldownHit> {
        let host = bare_host(url)?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.get_mut(&host)?;

        if now >= record.until {
            if take_probe {
                debug!(%host, "Cooldown expired");
                records.remove(&host);
            }
            return None;
        }

        if let Some(interval) = self.probe_interval {
            let span = record.until.saturating_duration_since(record.set_at);
            let last = record.last_probe.unwrap_or(record.set_at);
            if span >= self.probe_min_cooldown && now.saturating_duration_since(last) >= interval {
                if take_probe {
                    record.last_probe = Some(now);
                    info!(%host, reason = %record.reason, "Letting a probe through active cooldown");
                }
                return None;
            }
        }

        Some(CooldownHit {
            host,
            remaining: record.until.saturating_duration_since(now),
            reason: record.reason.clone(),
        })
    }

    pub fn set_cooldown(&self, url: &str, duration: Duration, reason: &str) -> Option<CooldownRecord> {
        self.set_cooldown_at(url, duration, reason, Instant::now())
    }

    /// Start or extend a cooldown. The expiry never moves earlier while the
    /// existing record is active. Returns `None` when `url` has no host.
    pub fn set_cooldown_at(
        &self,
        url: &str,
        duration: Duration,
        reason: &str,
        now: Instant,
    ) -> Option<CooldownRecord> {
        let host = bare_host(url)?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let proposed = now + duration;

        let record = match records.get_mut(&host) {
            Some(existing) if existing.until > now => {
                if proposed > existing.until {
                    existing.until = proposed;
                }
                existing.reason = reason.to_string();
                existing.clone()
            }
            _ => {
                let fresh = CooldownRecord {
                    host: host.clone(),
                    until: proposed,
                    set_at: now,
                    reason: reason.to_string(),
                    last_probe: None,
                };
                records.insert(host.clone(), fresh.clone());
                fresh
            }
        };

        info!(
            %host,
            reason,
            remaining_secs = record.until.saturating_duration_since(now).as_secs(),
            "Host cooldown set"
        );
        Some(record)
    }

    /// Number of records currently held (expired ones included until checked).
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn tracker() -> CooldownTracker {
        CooldownTracker::new(None, HOUR)
    }

    #[test]
    fn test_hosts_are_keyed_without_www() {
        let t = tracker();
        let now = Instant::now();
        t.set_cooldown_at("https://www.example.com/a", HOUR, "403", now);
        let hit = t.is_in_cooldown_at("http://example.com/other", now).unwrap();
        assert_eq!(hit.host, "example.com");
        assert_eq!(hit.reason, "403");
        assert!(t.is_in_cooldown_at("https://other.com/", now).is_none());
    }

    #[test]
    fn test_shorter_cooldown_never_shrinks_expiry() {
        let t = tracker();
        let now = Instant::now();
        let first = t.set_cooldown_at("example.com", 2 * HOUR, "captcha", now).unwrap();
        let later = now + Duration::from_secs(60);
        let second = t
            .set_cooldown_at("example.com", Duration::from_secs(120), "timeout", later)
            .unwrap();
        assert_eq!(second.until, first.until);
        assert_eq!(second.reason, "timeout");

        let third = t.set_cooldown_at("example.com", 3 * HOUR, "403", later).unwrap();
        assert!(third.until > first.until);
    }

    #[test]
    fn test_monotonic_across_many_updates() {
        let t = tracker();
        let start = Instant::now();
        let mut max_until = start;
        for (i, secs) in [600u64, 30, 7200, 5, 900, 3600, 1].into_iter().enumerate() {
            let now = start + Duration::from_secs(i as u64);
            let rec = t
                .set_cooldown_at("h.example", Duration::from_secs(secs), "x", now)
                .unwrap();
            assert!(rec.until >= max_until);
            max_until = rec.until;
        }
    }

    #[test]
    fn test_expired_records_are_evicted() {
        let t = tracker();
        let now = Instant::now();
        t.set_cooldown_at("example.com", Duration::from_secs(10), "429", now);
        assert!(t.is_in_cooldown_at("example.com", now + Duration::from_secs(9)).is_some());
        assert!(t.is_in_cooldown_at("example.com", now + Duration::from_secs(10)).is_none());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_expired_record_is_replaced_not_extended() {
        let t = tracker();
        let now = Instant::now();
        t.set_cooldown_at("example.com", Duration::from_secs(10), "a", now);
        let later = now + Duration::from_secs(20);
        let rec = t.set_cooldown_at("example.com", Duration::from_secs(5), "b", later).unwrap();
        assert_eq!(rec.until, later + Duration::from_secs(5));
        assert_eq!(rec.set_at, later);
    }

    #[test]
    fn test_remaining_is_reported() {
        let t = tracker();
        let now = Instant::now();
        t.set_cooldown_at("example.com", HOUR, "403", now);
        let hit = t.is_in_cooldown_at("example.com", now + Duration::from_secs(600)).unwrap();
        assert_eq!(hit.remaining, Duration::from_secs(3000));
    }

    #[test]
    fn test_probe_lets_one_request_through_per_interval() {
        let t = CooldownTracker::new(Some(Duration::from_secs(600)), HOUR);
        let now = Instant::now();
        t.set_cooldown_at("example.com", 6 * HOUR, "captcha", now);

        assert!(t.is_in_cooldown_at("example.com", now + Duration::from_secs(300)).is_some());
        let probe_at = now + Duration::from_secs(600);
        assert!(t.is_in_cooldown_at("example.com", probe_at).is_none());
        assert!(t.is_in_cooldown_at("example.com", probe_at + Duration::from_secs(1)).is_some());
        assert!(t.is_in_cooldown_at("example.com", probe_at + Duration::from_secs(600)).is_none());
    }

    #[test]
    fn test_is_cooling_does_not_spend_the_pass_through() {
        let t = CooldownTracker::new(Some(Duration::from_secs(600)), HOUR);
        let now = Instant::now();
        t.set_cooldown_at("example.com", 6 * HOUR, "status 403", now);
        let due = now + Duration::from_secs(600);

        assert!(t.is_cooling_at("example.com", now + Duration::from_secs(1)).is_some());
        assert!(t.is_cooling_at("example.com", due).is_none());
        assert!(t.is_cooling_at("example.com", due).is_none());
        assert!(t.is_in_cooldown_at("example.com", due).is_none());
        assert!(t.is_cooling_at("example.com", due + Duration::from_secs(1)).is_some());
        assert!(t.is_cooling_at("example.com", now + 7 * HOUR).is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_short_cooldowns_are_not_probed() {
        let t = CooldownTracker::new(Some(Duration::from_secs(10)), HOUR);
        let now = Instant::now();
        t.set_cooldown_at("example.com", Duration::from_secs(120), "timeout", now);
        assert!(t.is_in_cooldown_at("example.com", now + Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_unparseable_input_is_ignored() {
        let t = tracker();
        assert!(t.set_cooldown("", HOUR, "x").is_none());
        assert!(t.is_in_cooldown("").is_none());
    }
}
