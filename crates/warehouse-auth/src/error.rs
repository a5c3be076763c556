//! Error taxonomy for authentication and authenticated requests
//!
//! One closed enum covers every failure the session client can surface. It is
//! `Clone` so a single refresh failure can be handed to every queued waiter.

use std::time::Duration;

use serde::Serialize;

/// A field-level problem reported by the backend on 400/422.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct FieldIssue {
    #[serde(default)]
    pub field: String,
    pub message: String,
}

/// Errors from authentication and authenticated-request operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("CSRF state validation failed: {0}")]
    CsrfValidation(String),

    #[error("identity provider returned `{code}`")]
    OAuthProvider {
        code: String,
        description: Option<String>,
    },

    #[error("authorization code rejected: {0}")]
    InvalidAuthCode(String),

    #[error("account domain not allowed: {0}")]
    ForbiddenDomain(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The credential can no longer be renewed; the session is over.
    #[error("credential invalid: {0}")]
    TokenInvalid(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        issues: Vec<FieldIssue>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("service unavailable ({status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigurationError,
    NetworkError,
    Timeout,
    CsrfMismatch,
    OauthProviderError,
    InvalidAuthCode,
    ForbiddenDomain,
    Forbidden,
    TokenExpiredTerminal,
    Unauthorized,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    ServiceUnavailable,
    ServerError,
    StorageError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::CsrfMismatch => "CSRF_MISMATCH",
            ErrorCode::OauthProviderError => "OAUTH_PROVIDER_ERROR",
            ErrorCode::InvalidAuthCode => "INVALID_AUTH_CODE",
            ErrorCode::ForbiddenDomain => "FORBIDDEN_DOMAIN",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::TokenExpiredTerminal => "TOKEN_EXPIRED_TERMINAL",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider error codes that clear up on their own (RFC 6749 §4.1.2.1).
const RETRYABLE_PROVIDER_CODES: &[&str] = &["temporarily_unavailable", "server_error"];

/// The shape handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedError {
    pub message: String,
    pub code: ErrorCode,
    pub retryable: bool,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Configuration(_) => ErrorCode::ConfigurationError,
            AuthError::Network(_) => ErrorCode::NetworkError,
            AuthError::Timeout(_) => ErrorCode::Timeout,
            AuthError::CsrfValidation(_) => ErrorCode::CsrfMismatch,
            AuthError::OAuthProvider { .. } => ErrorCode::OauthProviderError,
            AuthError::InvalidAuthCode(_) => ErrorCode::InvalidAuthCode,
            AuthError::ForbiddenDomain(_) => ErrorCode::ForbiddenDomain,
            AuthError::Forbidden(_) => ErrorCode::Forbidden,
            AuthError::TokenInvalid(_) => ErrorCode::TokenExpiredTerminal,
            AuthError::Unauthorized(_) => ErrorCode::Unauthorized,
            AuthError::Validation { .. } => ErrorCode::Validation,
            AuthError::NotFound(_) => ErrorCode::NotFound,
            AuthError::Conflict(_) => ErrorCode::Conflict,
            AuthError::RateLimited { .. } => ErrorCode::RateLimited,
            AuthError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AuthError::Server { .. } => ErrorCode::ServerError,
            AuthError::Storage(_) => ErrorCode::StorageError,
            AuthError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether retrying the same operation can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Network(_)
            | AuthError::Timeout(_)
            | AuthError::ServiceUnavailable { .. }
            | AuthError::RateLimited { .. } => true,
            AuthError::OAuthProvider { code, .. } => {
                RETRYABLE_PROVIDER_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// Whether recovering requires starting the sign-in flow again.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            AuthError::CsrfValidation(_)
                | AuthError::ForbiddenDomain(_)
                | AuthError::InvalidAuthCode(_)
                | AuthError::TokenInvalid(_)
                | AuthError::Unauthorized(_)
        )
    }

    /// Server-supplied wait before retrying, when one was given.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AuthError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Category-specific message suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Configuration(_) => {
                "Sign-in is not configured for this installation. Contact your administrator."
                    .into()
            }
            AuthError::Network(_) => {
                "Unable to reach the server. Check your connection and try again.".into()
            }
            AuthError::Timeout(_) => "The server took too long to respond. Try again.".into(),
            AuthError::CsrfValidation(_) => {
                "Your sign-in attempt could not be verified. Please sign in again.".into()
            }
            AuthError::OAuthProvider { code, description } => match code.as_str() {
                "access_denied" => "Sign-in was cancelled.".into(),
                c if RETRYABLE_PROVIDER_CODES.contains(&c) => {
                    "The sign-in service is temporarily unavailable. Try again shortly.".into()
                }
                _ => description
                    .clone()
                    .unwrap_or_else(|| format!("Sign-in failed ({code}). Please sign in again.")),
            },
            AuthError::InvalidAuthCode(_) => {
                "The sign-in link expired or was already used. Please sign in again.".into()
            }
            AuthError::ForbiddenDomain(_) => {
                "This account's domain is not permitted. Sign in with an authorized account."
                    .into()
            }
            AuthError::Forbidden(_) => "You do not have permission to do that.".into(),
            AuthError::TokenInvalid(_) | AuthError::Unauthorized(_) => {
                "Your session has expired. Please sign in again.".into()
            }
            AuthError::Validation { message, issues } => {
                if issues.is_empty() {
                    message.clone()
                } else {
                    let fields: Vec<String> = issues
                        .iter()
                        .map(|i| format!("{}: {}", i.field, i.message))
                        .collect();
                    format!("{message} ({})", fields.join("; "))
                }
            }
            AuthError::NotFound(_) => "The requested record was not found.".into(),
            AuthError::Conflict(_) => {
                "The record was changed by someone else. Reload and try again.".into()
            }
            AuthError::RateLimited { retry_after, .. } => match retry_after {
                Some(d) => format!("Too many requests. Try again in {}s.", d.as_secs().max(1)),
                None => "Too many requests. Try again shortly.".into(),
            },
            AuthError::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Try again shortly.".into()
            }
            AuthError::Server { .. } => "The server encountered an error.".into(),
            AuthError::Storage(_) => "Could not save your session on this device.".into(),
            AuthError::Internal(_) => "Something went wrong.".into(),
        }
    }

    pub fn normalized(&self) -> NormalizedError {
        NormalizedError {
            message: self.to_string(),
            code: self.code(),
            retryable: self.is_retryable(),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
