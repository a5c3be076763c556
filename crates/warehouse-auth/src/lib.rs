//! Warehouse dashboard authentication primitives
//!
//! Everything the session layer builds on, with no session state of its own:
//! credential inspection, paired credential/profile storage, CSRF state,
//! backend auth endpoints, error classification, and retry policy.
//!
//! Sign-in flow:
//! 1. `CsrfGuard::issue()` + `build_authorization_url()` start the redirect
//! 2. The identity provider sends the user back with `code` and `state`
//! 3. `CsrfGuard::consume()` checks `state`, then `AuthApi::exchange_code()`
//! 4. The returned pair is stored via `CredentialStore::save_session()`
//! 5. `AuthApi::refresh()` renews the credential before `token::claims` expiry

pub mod api;
pub mod classify;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod csrf;
pub mod error;
pub mod retry;
pub mod token;

pub use api::{AuthApi, TokenResponse};
pub use classify::{Endpoint, classify_response, classify_transport, parse_retry_after};
pub use config::AuthConfig;
pub use constants::*;
pub use credentials::{Credential, CredentialStore, Session, UserProfile, domain_allowed};
pub use csrf::{CsrfGuard, build_authorization_url, generate_state};
pub use error::{AuthError, ErrorCode, FieldIssue, NormalizedError, Result};
pub use retry::RetryPolicy;
pub use token::{Claims, now_millis};
