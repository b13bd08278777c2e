//! Maps an upstream HTTP status (plus a couple of headers) onto the
//! disposition the engine acts on: mark the account unhealthy and fail
//! over, or surface the error to the caller untouched.

use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Credentials rejected; mark the account `error` and enqueue a
    /// refresh attempt.
    AuthFailed,
    /// Provider rate limit; cool the account down until `reset_at`.
    RateLimited { reset_at: DateTime<Utc> },
    /// Provider overloaded (Claude 529); cool down for a fixed interval.
    Overloaded,
    /// Transient upstream fault; brief temp-unschedulable cooldown.
    Transient,
    /// Terminal client error; surfaced as-is unless `failover_on_400`.
    BadRequest,
    /// Client disconnected; terminal, no account penalty.
    ClientClosed,
    /// Anything else in the 2xx/3xx/unrecognized range.
    Ok,
}

impl Disposition {
    /// Transient classifications (auth/rate-limit/overload/5xx, and 400
    /// only when `failover_on_400` is set) are the ones the engine retries
    /// on a different account; everything else surfaces straight to the
    /// caller.
    pub fn is_account_local(&self) -> bool {
        matches!(self, Disposition::AuthFailed | Disposition::RateLimited { .. } | Disposition::Overloaded | Disposition::Transient)
    }
}

pub fn classify(
    status: u16,
    headers: &HeaderMap,
    now: DateTime<Utc>,
    overload_cooldown_minutes: i64,
    failover_on_400: bool,
) -> Disposition {
    match status {
        200..=399 => Disposition::Ok,
        401 | 403 => Disposition::AuthFailed,
        429 => Disposition::RateLimited { reset_at: parse_retry_after(headers, now, overload_cooldown_minutes) },
        529 => Disposition::Overloaded,
        500..=504 => Disposition::Transient,
        400 => {
            if failover_on_400 {
                Disposition::Transient
            } else {
                Disposition::BadRequest
            }
        }
        499 => Disposition::ClientClosed,
        _ => Disposition::BadRequest,
    }
}

/// Prefers a standard `Retry-After` (seconds) header; several providers
/// also send rate-limit-reset style headers, checked as fallbacks before
/// defaulting to `overload_cooldown_minutes` from now.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>, overload_cooldown_minutes: i64) -> DateTime<Utc> {
    let seconds = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| {
            headers
                .get("x-ratelimit-reset-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<i64>().ok())
        });

    match seconds {
        Some(secs) => now + Duration::seconds(secs),
        None => now + Duration::minutes(overload_cooldown_minutes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn rate_limit_uses_retry_after_header() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("30"));
        match classify(429, &headers, now, 5, false) {
            Disposition::RateLimited { reset_at } => {
                assert_eq!(reset_at, now + Duration::seconds(30));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_without_header_falls_back_to_cooldown_config() {
        let now = Utc::now();
        let headers = HeaderMap::new();
        match classify(429, &headers, now, 5, false) {
            Disposition::RateLimited { reset_at } => {
                assert_eq!(reset_at, now + Duration::minutes(5));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn bad_request_is_terminal_unless_failover_enabled() {
        let now = Utc::now();
        let headers = HeaderMap::new();
        assert_eq!(classify(400, &headers, now, 5, false), Disposition::BadRequest);
        assert_eq!(classify(400, &headers, now, 5, true), Disposition::Transient);
    }

    #[test]
    fn client_closed_has_no_account_penalty() {
        let now = Utc::now();
        let headers = HeaderMap::new();
        let disposition = classify(499, &headers, now, 5, false);
        assert_eq!(disposition, Disposition::ClientClosed);
        assert!(!disposition.is_account_local());
    }

    #[test]
    fn overloaded_and_transient_are_account_local() {
        let now = Utc::now();
        let headers = HeaderMap::new();
        assert!(classify(529, &headers, now, 5, false).is_account_local());
        assert!(classify(503, &headers, now, 5, false).is_account_local());
        assert!(classify(401, &headers, now, 5, false).is_account_local());
    }
}
