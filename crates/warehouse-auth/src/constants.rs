//! Endpoint paths, storage keys and default timings
//!
//! The identity-provider values below are defaults for a Google OAuth client;
//! the client id and redirect URI themselves always come from configuration.

/// Backend endpoint exchanging an authorization code for `{token, user}`
pub const CALLBACK_PATH: &str = "/auth/callback";

/// Backend endpoint renewing the bearer credential
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Backend endpoint ending the server-side session (best effort)
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Backend endpoint returning the current user profile
pub const ME_PATH: &str = "/auth/me";

/// Default identity-provider authorization endpoint
pub const DEFAULT_AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Default OAuth scopes: enough to learn who the user is
pub const DEFAULT_SCOPE: &str = "openid email profile";

/// Persistent storage key holding the opaque credential string
pub const TOKEN_KEY: &str = "auth_token";

/// Persistent storage key holding the JSON user profile
pub const USER_KEY: &str = "auth_user";

/// Ephemeral storage key holding the pending CSRF state
pub const CSRF_STATE_KEY: &str = "oauth_state";

/// Maximum age of a pending CSRF state before the callback rejects it.
pub const CSRF_STATE_MAX_AGE_SECS: u64 = 600; // 10 minutes

/// Lead time before expiry at which the credential is proactively renewed.
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 300;

/// Timeout for auth endpoint calls (callback, refresh, logout, me)
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;

/// Timeout for general API calls
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
