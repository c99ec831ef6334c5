//! Classification of a single fetch attempt.
//!
//! The distinction between outcomes drives both the retry policy and the
//! credential pool:
//!
//! - **Success** and **NotFound** say nothing bad about the credential.
//! - **RateLimited** is credential-scoped: the credential backs off, the item
//!   is retried on whichever credential is usable next.
//! - **TransientError** (5xx, timeouts, connection failures) is retried with
//!   exponential backoff and counts against the credential's error streak.
//! - **PermanentError** (other 4xx) is never retried.
//!
//! Secondary ("abuse") rate limits are not always signalled structurally, so a
//! 403 whose body mentions a rate limit is treated as rate limiting. This is a
//! best-effort heuristic; the wording GitHub uses is not guaranteed to be
//! stable.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::clock;

/// Backoff applied when a rate limit response carries no usable hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Longest error body excerpt kept in a failure reason.
const REASON_EXCERPT_LEN: usize = 200;

/// The classified result of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// HTTP 200 with the raw patch body.
    Success(String),

    /// HTTP 404. The patch will never exist.
    NotFound,

    /// Primary or secondary rate limit hit on this credential.
    RateLimited { retry_after: Duration },

    /// Server error or network failure; worth retrying.
    TransientError(String),

    /// Client error other than 404 or rate limiting; not worth retrying.
    PermanentError(String),
}

impl FetchOutcome {
    /// Short label for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::NotFound => "not found",
            FetchOutcome::RateLimited { .. } => "rate limited",
            FetchOutcome::TransientError(_) => "transient error",
            FetchOutcome::PermanentError(_) => "permanent error",
        }
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOutcome::Success(body) => write!(f, "success ({} bytes)", body.len()),
            FetchOutcome::NotFound => write!(f, "not found"),
            FetchOutcome::RateLimited { retry_after } => {
                write!(f, "rate limited (retry after {}s)", retry_after.as_secs())
            }
            FetchOutcome::TransientError(reason) => write!(f, "transient error: {reason}"),
            FetchOutcome::PermanentError(reason) => write!(f, "permanent error: {reason}"),
        }
    }
}

/// Quota information reported by the API on a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// `X-RateLimit-Remaining`
    pub remaining: Option<u32>,

    /// `X-RateLimit-Reset`, as an instant.
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaHeaders {
    /// Extracts quota headers, ignoring values that don't parse.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let remaining = header_str(headers, REMAINING_HEADER).and_then(|v| v.parse().ok());
        let reset_at = header_str(headers, RESET_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        QuotaHeaders {
            remaining,
            reset_at,
        }
    }
}

/// Everything the crawler learns from one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    pub quota: QuotaHeaders,
}

impl FetchReport {
    /// A report without quota information (e.g. a connection failure).
    pub fn new(outcome: FetchOutcome) -> Self {
        FetchReport {
            outcome,
            quota: QuotaHeaders::default(),
        }
    }

    pub fn with_quota(mut self, quota: QuotaHeaders) -> Self {
        self.quota = quota;
        self
    }
}

/// Classifies an HTTP response that was received in full.
pub fn classify_response(
    status: u16,
    headers: &HeaderMap,
    body: String,
    now: DateTime<Utc>,
) -> FetchReport {
    let quota = QuotaHeaders::from_headers(headers);

    let outcome = match status {
        200 => FetchOutcome::Success(body),
        404 => FetchOutcome::NotFound,
        429 => FetchOutcome::RateLimited {
            retry_after: retry_after(headers, &quota, now),
        },
        403 if quota.remaining == Some(0)
            || headers.contains_key(RETRY_AFTER)
            || is_rate_limit_message(&body) =>
        {
            FetchOutcome::RateLimited {
                retry_after: retry_after(headers, &quota, now),
            }
        }
        code if (400..500).contains(&code) => {
            FetchOutcome::PermanentError(format!("HTTP {code}: {}", excerpt(&body)))
        }
        code if (500..600).contains(&code) => {
            FetchOutcome::TransientError(format!("HTTP {code}: {}", excerpt(&body)))
        }
        // 1xx/3xx that survived redirect handling and other oddities.
        code => FetchOutcome::TransientError(format!("unexpected HTTP {code}")),
    };

    FetchReport { outcome, quota }
}

/// Classifies a failure that produced no HTTP response.
pub fn classify_transport_error(err: &reqwest::Error) -> FetchOutcome {
    if err.is_builder() || err.is_redirect() {
        FetchOutcome::PermanentError(err.to_string())
    } else {
        FetchOutcome::TransientError(err.to_string())
    }
}

/// How long to back off after a rate limit response.
///
/// Prefers `Retry-After` (seconds), then the primary quota reset time when
/// the quota is exhausted, then [`DEFAULT_RETRY_AFTER`].
fn retry_after(headers: &HeaderMap, quota: &QuotaHeaders, now: DateTime<Utc>) -> Duration {
    if let Some(secs) = header_str(headers, RETRY_AFTER.as_str()).and_then(|v| v.parse::<u64>().ok())
    {
        return Duration::from_secs(secs);
    }

    match (quota.remaining, quota.reset_at) {
        (Some(0), Some(reset_at)) if reset_at > now => clock::until(now, reset_at),
        _ => DEFAULT_RETRY_AFTER,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// Checks if a response body indicates a rate limit.
fn is_rate_limit_message(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("rate limit")
        || message_lower.contains("secondary rate")
        || message_lower.contains("abuse detection")
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(REASON_EXCERPT_LEN) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for &(name, value) in pairs {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        map
    }

    fn classify(status: u16, pairs: &[(&'static str, &'static str)], body: &str) -> FetchOutcome {
        classify_response(status, &headers(pairs), body.to_string(), Utc::now()).outcome
    }

    #[test]
    fn ok_is_success_with_body() {
        assert_eq!(
            classify(200, &[], "From 1234\n"),
            FetchOutcome::Success("From 1234\n".to_string())
        );
    }

    #[test]
    fn ok_body_mentioning_rate_limit_is_still_success() {
        // A patch may legitimately touch rate limiting code.
        assert!(matches!(
            classify(200, &[], "+// handle API rate limit"),
            FetchOutcome::Success(_)
        ));
    }

    #[test]
    fn not_found() {
        assert_eq!(classify(404, &[], "Not Found"), FetchOutcome::NotFound);
    }

    #[test]
    fn too_many_requests_uses_retry_after() {
        assert_eq!(
            classify(429, &[("retry-after", "5")], ""),
            FetchOutcome::RateLimited {
                retry_after: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn rate_limit_defaults_to_sixty_seconds() {
        assert_eq!(
            classify(429, &[], ""),
            FetchOutcome::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER
            }
        );
    }

    #[test]
    fn forbidden_with_secondary_limit_message_is_rate_limited() {
        assert!(matches!(
            classify(
                403,
                &[],
                "You have exceeded a secondary rate limit. Please wait a few minutes."
            ),
            FetchOutcome::RateLimited { .. }
        ));
    }

    #[test]
    fn forbidden_with_exhausted_quota_waits_until_reset() {
        let now = Utc::now();
        let reset = now + TimeDelta::seconds(120);
        let mut map = headers(&[("x-ratelimit-remaining", "0")]);
        map.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from_str(&reset.timestamp().to_string()).unwrap(),
        );

        let report = classify_response(403, &map, String::new(), now);

        match report.outcome {
            FetchOutcome::RateLimited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(120));
                assert!(retry_after >= Duration::from_secs(119));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(report.quota.remaining, Some(0));
    }

    #[test]
    fn plain_forbidden_is_permanent() {
        assert!(matches!(
            classify(403, &[], "Resource not accessible by integration"),
            FetchOutcome::PermanentError(_)
        ));
    }

    #[test]
    fn other_client_errors_are_permanent() {
        assert!(matches!(
            classify(401, &[], "Bad credentials"),
            FetchOutcome::PermanentError(_)
        ));
        assert!(matches!(
            classify(422, &[], ""),
            FetchOutcome::PermanentError(_)
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 504] {
            assert!(matches!(
                classify(status, &[], "oops"),
                FetchOutcome::TransientError(_)
            ));
        }
    }

    #[test]
    fn quota_headers_are_parsed_on_any_status() {
        let report = classify_response(
            200,
            &headers(&[
                ("x-ratelimit-remaining", "4321"),
                ("x-ratelimit-reset", "1700000000"),
            ]),
            String::new(),
            Utc::now(),
        );

        assert_eq!(report.quota.remaining, Some(4321));
        assert_eq!(report.quota.reset_at, DateTime::from_timestamp(1_700_000_000, 0));
    }

    #[test]
    fn malformed_quota_headers_are_ignored() {
        let quota = QuotaHeaders::from_headers(&headers(&[
            ("x-ratelimit-remaining", "lots"),
            ("x-ratelimit-reset", "soon"),
        ]));
        assert_eq!(quota, QuotaHeaders::default());
    }

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limit_message("API rate limit exceeded"));
        assert!(is_rate_limit_message("secondary rate limit"));
        assert!(is_rate_limit_message("abuse detection mechanism"));
        assert!(!is_rate_limit_message("Permission denied"));
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        let body = "x".repeat(1000);
        assert_eq!(excerpt(&body).len(), REASON_EXCERPT_LEN);
        assert_eq!(excerpt("  short  "), "short");
    }
}
