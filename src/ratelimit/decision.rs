//! Admission decisions and the standard rejection response.

use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};

/// `X-RateLimit-Limit`
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`, ISO-8601
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const REJECTION_ERROR: &str = "Too many requests";

/// Which counter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The shared store
    Distributed,
    /// The in-process fallback
    Local,
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The policy limit
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Counter that made the call
    pub backend: BackendKind,
}

impl Decision {
    /// Build a decision from a post-increment count.
    pub fn from_count(
        count: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
        backend: BackendKind,
    ) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            backend,
        }
    }

    /// Whole seconds until the window resets, rounded up. Zero once the reset has passed.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis as u64).div_ceil(1000)
        }
    }

    /// Conventional rate limit headers. `Retry-After` is only set on rejections.
    pub fn headers(&self, now: DateTime<Utc>) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(4);
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));

        let reset = self.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.insert(RESET_HEADER, value);
        }

        if !self.allowed {
            headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs(now)));
        }

        headers
    }

    /// The rejection payload for a denied decision, `None` when allowed.
    pub fn rejection(&self, now: DateTime<Utc>) -> Option<Rejection> {
        if self.allowed {
            return None;
        }

        let retry_after = self.retry_after_secs(now);
        Some(Rejection {
            headers: self.headers(now),
            body: RejectionBody {
                error: REJECTION_ERROR.to_string(),
                message: retry_message(retry_after),
                retry_after,
            },
        })
    }
}

fn retry_message(retry_after: u64) -> String {
    format!("Rate limit exceeded. Try again in {} seconds.", retry_after)
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

/// A rendered rejection, ready to attach to a response.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// Rate limit headers, including `Retry-After`
    pub headers: HeaderMap,
    /// JSON body
    pub body: RejectionBody,
}

impl Rejection {
    /// Status code for every rejection.
    pub const STATUS: StatusCode = StatusCode::TOO_MANY_REQUESTS;

    /// Seconds the caller should wait.
    pub fn retry_after(&self) -> u64 {
        self.body.retry_after
    }

    /// Serialize the body to JSON.
    pub fn body_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_default()
    }

    /// Build a complete `429 Too Many Requests` response.
    pub fn into_response(self) -> Response<String> {
        let body = self.body_json();
        let mut response = Response::new(body);
        *response.status_mut() = Self::STATUS;

        let headers = response.headers_mut();
        headers.extend(self.headers);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        response
    }
}

/// Parse `X-RateLimit-Reset` back into a timestamp.
pub fn parse_reset_header(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let value = headers.get(RESET_HEADER)?.to_str().ok()?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse `Retry-After` as whole seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

/// Result shape for action-style (non-HTTP) call sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    /// Whether the action may proceed
    pub success: bool,
    /// Human-readable reason when denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds to wait when denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ActionOutcome {
    /// Summarize a decision for an action caller.
    pub fn from_decision(decision: &Decision, now: DateTime<Utc>) -> Self {
        if decision.allowed {
            return Self {
                success: true,
                error: None,
                retry_after: None,
            };
        }

        let retry_after = decision.retry_after_secs(now);
        Self {
            success: false,
            error: Some(retry_message(retry_after)),
            retry_after: Some(retry_after),
        }
    }
}
