//! Detection of throttling responses.
//!
//! Detection is deliberately loose: a false positive costs one extra rotation,
//! a false negative keeps hammering an endpoint that is already throttling us.

use http::header::RETRY_AFTER;
use http::HeaderMap;
use std::time::Duration;

const RATE_LIMIT_STATUSES: [u16; 2] = [429, 503];

const REMAINING_HEADERS: [&str; 4] = [
    "x-ratelimit-remaining",
    "x-rate-limit-remaining",
    "ratelimit-remaining",
    "retry-after",
];

const BODY_KEYWORDS: [&str; 7] = [
    "rate limit",
    "too many requests",
    "request limit",
    "throttle",
    "slow down",
    "exceeded",
    "quota",
];

/// Returns true when the response looks throttled.
pub fn is_rate_limited(status: u16, headers: &HeaderMap, body: &str) -> bool {
    if RATE_LIMIT_STATUSES.contains(&status) {
        return true;
    }

    let exhausted = REMAINING_HEADERS.iter().any(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .is_some_and(|remaining| remaining == 0.0)
    });
    if exhausted {
        return true;
    }

    let body = body.to_lowercase();
    BODY_KEYWORDS.iter().any(|keyword| body.contains(keyword))
}

/// Delay requested by a numeric `Retry-After` header.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    if seconds.is_finite() && seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}
