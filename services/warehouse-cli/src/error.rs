//! CLI-specific error types

use thiserror::Error;

/// Failures of the interactive commands themselves. Backend and session
/// errors arrive as `warehouse_auth::AuthError` and are reported through
/// their user message.
#[derive(Error, Debug)]
pub enum Error {
    #[error("redirect_uri is not a valid URL: {0}")]
    InvalidRedirect(String),

    #[error("redirect_uri must point at a loopback address, got: {0}")]
    NonLoopbackRedirect(String),

    #[error("no sign-in callback received within {0}s")]
    CallbackTimeout(u64),

    #[error("sign-in cancelled")]
    Cancelled,

    #[error("not signed in (run `warehouse login`)")]
    NotSignedIn,
}

/// Result alias using CLI Error
pub type Result<T> = std::result::Result<T, Error>;
