//! Rate-limit header parsing.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;

pub const DATE: &str = "date";
pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RETRY_AFTER: &str = "retry-after";
pub const GLOBAL: &str = "x-ratelimit-global";

/// Rate-limit information carried by one response.
///
/// Every field is optional; values that fail to parse are treated as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    /// Server timestamp of the response (`Date`, RFC 2822).
    pub date: Option<DateTime<Utc>>,
    /// Slots per window.
    pub limit: Option<u32>,
    /// Slots left after this call.
    pub remaining: Option<u32>,
    /// Instant the window resets (`X-RateLimit-Reset`, fractional unix seconds).
    pub reset_at: Option<DateTime<Utc>>,
    /// `Retry-After`, in milliseconds on the wire.
    pub retry_after: Option<Duration>,
    /// `X-RateLimit-Global: true`.
    pub global: bool,
}

/// Window parameters for a bucket update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketUpdate {
    pub limit: u32,
    pub remaining: u32,
    pub now: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            date: header_str(headers, DATE)
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|d| d.with_timezone(&Utc)),
            limit: header_str(headers, LIMIT).and_then(|v| v.parse().ok()),
            remaining: header_str(headers, REMAINING).and_then(|v| v.parse().ok()),
            reset_at: header_str(headers, RESET)
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(unix_seconds),
            retry_after: header_str(headers, RETRY_AFTER)
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(millis),
            global: header_str(headers, GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }

    /// Window parameters, when limit, remaining and reset are all present.
    ///
    /// `now` falls back to `fallback_now` when the response had no usable `Date`. A present
    /// `Retry-After` takes precedence over the reset timestamp.
    pub fn bucket_update(&self, fallback_now: DateTime<Utc>) -> Option<BucketUpdate> {
        let (limit, remaining, reset_at) = (self.limit?, self.remaining?, self.reset_at?);
        let now = self.date.unwrap_or(fallback_now);
        let reset_at = self
            .retry_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|wait| now.checked_add_signed(wait))
            .unwrap_or(reset_at);
        Some(BucketUpdate { limit, remaining, now, reset_at })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

/// `None` unless the value fits a `Duration`.
pub(crate) fn millis(ms: f64) -> Option<Duration> {
    if !ms.is_finite() || ms < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(ms / 1000.0).ok()
}
