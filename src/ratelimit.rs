//! Per-session sliding-window rate limiting.
//!
//! Each session gets three windows: a 1 second burst window, the main
//! configurable window (default 60 requests per 60 s), and a 1 hour window.
//! Buckets are derived state only; idle ones are cleaned hourly.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

const BURST_WINDOW_SECS: u64 = 1;
const BURST_MAX: u64 = 10;
const HOURLY_WINDOW_SECS: u64 = 3600;
const HOURLY_MAX: u64 = 1000;
/// Buckets untouched for this long are dropped by `cleanup`.
const BUCKET_IDLE_SECS: i64 = 3600;

// ─── Sliding window ──────────────────────────────────────────────────────────

/// A sliding-window counter over request timestamps.
struct SlidingWindow {
    window_secs: u64,
    max_count: u64,
    events: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn new(window_secs: u64, max_count: u64) -> Self {
        Self {
            window_secs,
            max_count,
            events: VecDeque::new(),
        }
    }

    /// Discard events older than the window boundary.
    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.window_secs as i64);
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn is_limited(&mut self, now: DateTime<Utc>) -> bool {
        self.evict(now);
        self.events.len() as u64 >= self.max_count
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.evict(now);
        self.events.push_back(now);
    }

    /// Seconds until the oldest event leaves the window. Zero when not limited.
    fn retry_after_secs(&mut self, now: DateTime<Utc>) -> u64 {
        if !self.is_limited(now) {
            return 0;
        }
        self.events
            .front()
            .map(|oldest| {
                let expiry = *oldest + Duration::seconds(self.window_secs as i64);
                (expiry - now).num_seconds().max(1) as u64
            })
            .unwrap_or(1)
    }
}

// ─── Limiter ─────────────────────────────────────────────────────────────────

struct Bucket {
    burst: SlidingWindow,
    main: SlidingWindow,
    hourly: SlidingWindow,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

pub struct RateLimiter {
    main_window_secs: u64,
    main_max: u64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// `window_ms` / `max_requests` configure the main window
    /// (`RATE_LIMIT_WINDOW_MS` / `RATE_LIMIT_MAX_REQUESTS`).
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            main_window_secs: (window_ms / 1000).max(1),
            main_max: max_requests.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn make_bucket(&self, now: DateTime<Utc>) -> Bucket {
        Bucket {
            burst: SlidingWindow::new(BURST_WINDOW_SECS, BURST_MAX),
            main: SlidingWindow::new(self.main_window_secs, self.main_max),
            hourly: SlidingWindow::new(HOURLY_WINDOW_SECS, HOURLY_MAX),
            last_seen: now,
        }
    }

    /// Check and record one request for `key`.
    pub async fn check(&self, key: &str) -> Decision {
        let now = Utc::now();
        let mut map = self.buckets.lock().await;
        let bucket = map
            .entry(key.to_string())
            .or_insert_with(|| self.make_bucket(now));
        bucket.last_seen = now;

        if bucket.burst.is_limited(now) || bucket.main.is_limited(now) || bucket.hourly.is_limited(now)
        {
            let retry = bucket
                .burst
                .retry_after_secs(now)
                .max(bucket.main.retry_after_secs(now))
                .max(bucket.hourly.retry_after_secs(now));
            debug!(key = %key, retry_after = retry, "rate limit hit");
            return Decision::Limited {
                retry_after_secs: retry,
            };
        }

        bucket.burst.record(now);
        bucket.main.record(now);
        bucket.hourly.record(now);
        Decision::Allowed
    }

    /// Drop the bucket for a removed session.
    pub async fn forget(&self, key: &str) {
        self.buckets.lock().await.remove(key);
    }

    /// Remove buckets untouched for over an hour. Returns how many were dropped.
    pub async fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - Duration::seconds(BUCKET_IDLE_SECS);
        let mut map = self.buckets.lock().await;
        let before = map.len();
        map.retain(|_, b| b.last_seen > cutoff);
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_main_max_then_limits() {
        // Wide burst/hourly headroom; main window of 5 per 60 s.
        let limiter = RateLimiter::new(60_000, 5);
        let mut allowed = 0;
        for _ in 0..5 {
            // The burst cap (10/s) sits above the main cap here, so only
            // the main window can limit.
            if limiter.check("S1").await == Decision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
        match limiter.check("S1").await {
            Decision::Limited { retry_after_secs } => assert!(retry_after_secs >= 1),
            Decision::Allowed => panic!("sixth request must be limited"),
        }
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(60_000, 1);
        assert_eq!(limiter.check("A").await, Decision::Allowed);
        assert_eq!(limiter.check("B").await, Decision::Allowed);
        assert!(matches!(
            limiter.check("A").await,
            Decision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn forget_resets_a_key() {
        let limiter = RateLimiter::new(60_000, 1);
        assert_eq!(limiter.check("A").await, Decision::Allowed);
        assert!(matches!(limiter.check("A").await, Decision::Limited { .. }));
        limiter.forget("A").await;
        assert_eq!(limiter.check("A").await, Decision::Allowed);
    }

    #[tokio::test]
    async fn cleanup_drops_idle_buckets() {
        let limiter = RateLimiter::new(60_000, 5);
        limiter.check("A").await;
        limiter.check("B").await;
        {
            let mut map = limiter.buckets.lock().await;
            map.get_mut("A").unwrap().last_seen = Utc::now() - Duration::seconds(7200);
        }
        assert_eq!(limiter.cleanup().await, 1);
        let map = limiter.buckets.lock().await;
        assert!(map.contains_key("B"));
        assert!(!map.contains_key("A"));
    }

    #[tokio::test]
    async fn burst_window_caps_one_second_spikes() {
        // Main window generous; burst cap is the binding constraint.
        let limiter = RateLimiter::new(60_000, 1000);
        let mut allowed = 0;
        for _ in 0..BURST_MAX + 3 {
            if limiter.check("S").await == Decision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, BURST_MAX);
    }
}
