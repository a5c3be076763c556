//! HTTP status classification for backend responses
//!
//! Maps a non-success status plus its body to an `AuthError`. The backend
//! reports errors as `{"message": "...", "code": "...", "errors": [...]}`;
//! every field is optional and unknown shapes fall back to the raw body text.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{AuthError, FieldIssue};

/// Which endpoint produced the response. A 401 means different things on
/// each: a bad code on the callback, a dead session on refresh, and
/// "go refresh" everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Callback,
    Refresh,
    Api,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: Option<String>,
    error: Option<serde_json::Value>,
    code: Option<String>,
    errors: Option<Vec<FieldIssue>>,
    issues: Option<Vec<FieldIssue>>,
    retry_after: Option<u64>,
}

impl ErrorBody {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    fn message(&self, fallback: &str) -> String {
        if let Some(m) = &self.message {
            return m.clone();
        }
        match &self.error {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Object(o)) => o
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| fallback.to_string()),
            _ if !fallback.is_empty() => fallback.to_string(),
            _ => "no details".to_string(),
        }
    }

    fn code_is(&self, wanted: &str) -> bool {
        self.code
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(wanted))
    }
}

/// Parse a `Retry-After` header given in delta-seconds.
///
/// HTTP-date values are ignored; the caller falls back to computed backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Classify a non-success backend response.
pub fn classify_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
    endpoint: Endpoint,
) -> AuthError {
    let parsed = ErrorBody::parse(body);
    let message = parsed.message(body.trim());

    match status {
        400 | 422 => {
            if endpoint == Endpoint::Callback && parsed.code_is("INVALID_AUTH_CODE") {
                return AuthError::InvalidAuthCode(message);
            }
            let issues = parsed
                .errors
                .clone()
                .or_else(|| parsed.issues.clone())
                .unwrap_or_default();
            AuthError::Validation { message, issues }
        }
        401 => match endpoint {
            Endpoint::Callback => AuthError::InvalidAuthCode(message),
            Endpoint::Refresh => AuthError::TokenInvalid(message),
            Endpoint::Api => AuthError::Unauthorized(message),
        },
        403 => {
            if parsed.code_is("FORBIDDEN_DOMAIN") {
                AuthError::ForbiddenDomain(message)
            } else {
                AuthError::Forbidden(message)
            }
        }
        404 => AuthError::NotFound(message),
        408 => AuthError::Timeout(message),
        409 => AuthError::Conflict(message),
        429 => AuthError::RateLimited {
            message,
            retry_after: retry_after.or(parsed.retry_after.map(Duration::from_secs)),
        },
        502..=504 => AuthError::ServiceUnavailable { status, message },
        _ => AuthError::Server { status, message },
    }
}

/// Classify a transport-level failure (no HTTP response received).
pub fn classify_transport(err: &reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::Timeout(err.to_string())
    } else if err.is_decode() {
        AuthError::Internal(format!("invalid response body: {err}"))
    } else if err.is_builder() {
        AuthError::Configuration(format!("invalid request: {err}"))
    } else {
        AuthError::Network(err.to_string())
    }
}
