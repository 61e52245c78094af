// src/rate_limiter/types.rs
//! Data shared between the rate limiter components: priorities, the
//! header-derived quota state, response descriptors and metric records.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Epoch values at or above this are absolute timestamps, below it they are deltas.
const EPOCH_SECONDS_THRESHOLD: f64 = 1_000_000_000.0;

/// Request priority levels. `Critical` is the highest and is reserved for purchase calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Low = 0,      // Health checks, connectivity tests
    Normal = 1,   // General reads
    High = 2,     // Collection lookups
    Critical = 3, // Prices and purchases
}

impl RequestPriority {
    /// Highest first, the order the queue drains partitions in
    pub const ALL: [RequestPriority; 4] = [
        RequestPriority::Critical,
        RequestPriority::High,
        RequestPriority::Normal,
        RequestPriority::Low,
    ];

    /// How long a request of this priority may wait for dispatch in total
    pub fn timeout_budget(self) -> Duration {
        match self {
            RequestPriority::Critical => Duration::from_secs(30),
            RequestPriority::High => Duration::from_secs(15),
            RequestPriority::Normal => Duration::from_secs(10),
            RequestPriority::Low => Duration::from_secs(5),
        }
    }

    /// Partition index, 0 for `Critical`
    pub fn index(self) -> usize {
        3 - self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestPriority::Critical => "CRITICAL",
            RequestPriority::High => "HIGH",
            RequestPriority::Normal => "NORMAL",
            RequestPriority::Low => "LOW",
        }
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota information learned from upstream response headers.
///
/// Owned by the rate limiter service; nothing else mutates it. `Default` is
/// the unconstrained state used on first run (no quota known).
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
    pub remaining_quota: Option<u64>,
    pub reset_timestamp: Option<DateTime<Utc>>,
    /// Last server-provided retry-after, in seconds. Kept until overwritten.
    pub retry_after: Option<u64>,
    pub last_updated: DateTime<Utc>,
    /// ETag per URL
    pub etags: BTreeMap<String, String>,
    /// Last-Modified per URL
    pub last_modified: BTreeMap<String, String>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            remaining_quota: None,
            reset_timestamp: None,
            retry_after: None,
            last_updated: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            etags: BTreeMap::new(),
            last_modified: BTreeMap::new(),
        }
    }
}

impl RateLimitState {
    /// Applies `x-ratelimit-remaining`, `x-ratelimit-reset` and `retry-after`.
    /// Headers that are absent or unparsable leave the previous value untouched.
    pub fn update_from_headers(&mut self, meta: &ResponseMeta, now: DateTime<Utc>) {
        if let Some(remaining) = meta
            .header("x-ratelimit-remaining")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.remaining_quota = Some(remaining);
        }

        if let Some(reset) = meta
            .header("x-ratelimit-reset")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
        {
            self.reset_timestamp = if reset >= EPOCH_SECONDS_THRESHOLD {
                Utc.timestamp_millis_opt((reset * 1000.0) as i64).single()
            } else {
                chrono::Duration::from_std(Duration::from_secs_f64(reset))
                    .ok()
                    .map(|delta| now + delta)
            };
        }

        if let Some(retry_after) = meta.retry_after(now) {
            self.retry_after = Some(retry_after.as_secs());
        }

        self.last_updated = now;
    }

    /// Time left until the quota resets when no request may be sent.
    /// `reserved` counts admissions whose responses have not arrived yet.
    pub fn quota_exhausted_wait(&self, now: DateTime<Utc>, reserved: u64) -> Option<Duration> {
        let remaining = self.remaining_quota?;
        if remaining.saturating_sub(reserved) > 0 {
            return None;
        }
        let reset = self.reset_timestamp?;
        (reset - now).to_std().ok().filter(|wait| !wait.is_zero())
    }

    /// Known quota minus the admissions still in flight
    pub fn effective_remaining(&self, reserved: u64) -> Option<u64> {
        self.remaining_quota.map(|r| r.saturating_sub(reserved))
    }

    /// Remembers `etag` / `last-modified` of a delivered response for its URL
    pub fn record_validators(&mut self, meta: &ResponseMeta) {
        let Some(url) = meta.url.as_deref() else {
            return;
        };
        if let Some(etag) = meta.header("etag") {
            self.etags.insert(url.to_string(), etag.to_string());
        }
        if let Some(modified) = meta.header("last-modified") {
            self.last_modified.insert(url.to_string(), modified.to_string());
        }
    }

    /// `If-None-Match` / `If-Modified-Since` headers for a conditional request
    pub fn conditional_headers(&self, url: &str) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(etag) = self.etags.get(url) {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(modified) = self.last_modified.get(url) {
            headers.push(("If-Modified-Since".to_string(), modified.clone()));
        }
        headers
    }
}

/// What one network attempt looked like: status and (lower-cased) headers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    pub endpoint: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Full request URL, the key for cache validators
    pub url: Option<String>,
}

impl ResponseMeta {
    pub fn new(endpoint: impl Into<String>, status: u16) -> Self {
        Self {
            endpoint: endpoint.into(),
            status,
            headers: HashMap::new(),
            url: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `retry-after` as delay-seconds, or as an HTTP date relative to `now`
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        let raw = self.header("retry-after")?.trim();
        if let Ok(secs) = raw.parse::<f64>() {
            return Duration::try_from_secs_f64(secs).ok();
        }
        let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
        Some((at - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn classify(&self) -> ResponseClass {
        ResponseClass::from_status(self.status)
    }
}

/// A response descriptor paired with the value the caller extracted
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange<T> {
    pub meta: ResponseMeta,
    pub value: T,
}

impl<T> Exchange<T> {
    pub fn new(meta: ResponseMeta, value: T) -> Self {
        Self { meta, value }
    }

    pub fn status(&self) -> u16 {
        self.meta.status
    }
}

/// The attempt never produced an HTTP response (connect error, timeout, ...)
#[derive(Debug, Clone, Error)]
#[error("{endpoint}: {message}")]
pub struct TransportError {
    pub endpoint: String,
    pub message: String,
}

impl TransportError {
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// How the service treats a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Handed to the caller to interpret (2xx, 304, 4xx other than 429)
    Delivered,
    /// 429, retried and counted by the circuit breaker
    Throttled,
    /// 5xx, retried but breaker-neutral
    Upstream,
}

impl ResponseClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ResponseClass::Throttled,
            500..=599 => ResponseClass::Upstream,
            _ => ResponseClass::Delivered,
        }
    }
}

/// Append-only observability record, one per attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetric {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    /// `None` when the attempt failed before a response arrived
    pub status_code: Option<u16>,
    pub response_time: Duration,
    pub was_rate_limited: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_priority_ordering_and_budgets() {
        assert!(RequestPriority::Critical > RequestPriority::High);
        assert!(RequestPriority::High > RequestPriority::Normal);
        assert!(RequestPriority::Normal > RequestPriority::Low);
        assert_eq!(RequestPriority::Critical.index(), 0);
        assert_eq!(RequestPriority::Low.index(), 3);
        assert_eq!(
            RequestPriority::Critical.timeout_budget(),
            Duration::from_secs(30)
        );
        assert_eq!(RequestPriority::Low.timeout_budget(), Duration::from_secs(5));
    }

    #[test]
    fn test_reset_header_accepts_epoch_and_delta() {
        let now = at(1_700_000_000);
        let mut state = RateLimitState::default();

        let meta = ResponseMeta::new("price", 200)
            .with_header("X-RateLimit-Remaining", "7")
            .with_header("X-RateLimit-Reset", "30");
        state.update_from_headers(&meta, now);
        assert_eq!(state.remaining_quota, Some(7));
        assert_eq!(state.reset_timestamp, Some(at(1_700_000_030)));
        assert_eq!(state.last_updated, now);

        let meta = ResponseMeta::new("price", 200).with_header("x-ratelimit-reset", "1700000100");
        state.update_from_headers(&meta, now);
        assert_eq!(state.reset_timestamp, Some(at(1_700_000_100)));
        assert_eq!(state.remaining_quota, Some(7));
    }

    #[test]
    fn test_retry_after_is_sticky() {
        let now = at(1_700_000_000);
        let mut state = RateLimitState::default();
        state.update_from_headers(
            &ResponseMeta::new("buy", 429).with_header("Retry-After", "12"),
            now,
        );
        state.update_from_headers(&ResponseMeta::new("buy", 200), now);
        assert_eq!(state.retry_after, Some(12));
    }

    #[test]
    fn test_quota_wait_accounts_for_reservations() {
        let now = at(1_700_000_000);
        let state = RateLimitState {
            remaining_quota: Some(2),
            reset_timestamp: Some(at(1_700_000_005)),
            ..RateLimitState::default()
        };
        assert_eq!(state.quota_exhausted_wait(now, 0), None);
        assert_eq!(
            state.quota_exhausted_wait(now, 2),
            Some(Duration::from_secs(5))
        );
        // reset already passed
        assert_eq!(state.quota_exhausted_wait(at(1_700_000_010), 2), None);
    }

    #[test]
    fn test_validators_feed_conditional_headers() {
        let url = "https://api.stickerdom.store/api/v1/collection/19";
        let mut state = RateLimitState::default();
        let meta = ResponseMeta::new("collection", 200)
            .with_url(url)
            .with_header("ETag", "\"abc\"")
            .with_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT");
        state.record_validators(&meta);

        assert_eq!(
            state.conditional_headers(url),
            vec![
                ("If-None-Match".to_string(), "\"abc\"".to_string()),
                (
                    "If-Modified-Since".to_string(),
                    "Wed, 21 Oct 2015 07:28:00 GMT".to_string()
                ),
            ]
        );
        assert!(state.conditional_headers("https://other").is_empty());
    }

    #[test]
    fn test_response_classification() {
        assert_eq!(ResponseClass::from_status(200), ResponseClass::Delivered);
        assert_eq!(ResponseClass::from_status(304), ResponseClass::Delivered);
        assert_eq!(ResponseClass::from_status(404), ResponseClass::Delivered);
        assert_eq!(ResponseClass::from_status(429), ResponseClass::Throttled);
        assert_eq!(ResponseClass::from_status(503), ResponseClass::Upstream);
    }
}
