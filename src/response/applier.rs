//! Maps decisions onto HTTP responses.

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::ratelimit::Decision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch milliseconds.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// What the HTTP layer should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Continue to the handler unchanged
    Proceed,
    /// Short-circuit with this rejection
    Reject(Rejection),
}

impl Admission {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Admission::Proceed)
    }
}

/// Body of a rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub retry_after_seconds: u64,
    pub limit: u32,
    pub reset_at: u64,
}

/// A rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub body: RejectionBody,
}

impl Rejection {
    /// Serialized JSON body.
    pub fn body_json(&self) -> String {
        serde_json::json!({
            "error": self.body.error,
            "retryAfterSeconds": self.body.retry_after_seconds,
            "limit": self.body.limit,
            "resetAt": self.body.reset_at,
        })
        .to_string()
    }

    /// Build the full response, carrying the headers already set by
    /// [`apply_decision`].
    pub fn into_response(self, headers: HeaderMap) -> Response<String> {
        let mut response = Response::new(self.body_json());
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Write rate limit headers and decide whether the request proceeds.
///
/// Limit, remaining and reset are always written; `Retry-After` only on
/// rejection. Touches nothing but `headers`.
pub fn apply_decision(decision: &Decision, headers: &mut HeaderMap) -> Admission {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));

    if decision.allowed {
        return Admission::Proceed;
    }

    let retry_after_seconds = decision.retry_after_secs().max(1);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_seconds));

    Admission::Reject(Rejection {
        status: StatusCode::TOO_MANY_REQUESTS,
        body: RejectionBody {
            error: "rate limit exceeded".to_string(),
            retry_after_seconds,
            limit: decision.limit,
            reset_at: decision.reset_at,
        },
    })
}
