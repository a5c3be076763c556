//! Authentication settings
//!
//! Deserialized from the `[auth]` table of the application config. The OAuth
//! client id and redirect URI have no defaults: a missing one is reported as a
//! `ConfigurationError` when login is attempted, not at load time, so a
//! previously stored session can still be used to make requests.

use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_API_TIMEOUT_SECS, DEFAULT_AUTH_TIMEOUT_SECS, DEFAULT_AUTHORIZE_ENDPOINT,
    DEFAULT_REFRESH_THRESHOLD_SECS, DEFAULT_SCOPE,
};
use crate::error::{AuthError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_authorize_endpoint")]
    pub authorize_endpoint: String,
    /// Base URL of the dashboard backend, e.g. `https://wms.example.com/api`
    #[serde(default)]
    pub api_base_url: String,
    /// Email domains allowed to sign in. Empty allows every domain.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_authorize_endpoint() -> String {
    DEFAULT_AUTHORIZE_ENDPOINT.to_string()
}

fn default_refresh_threshold_secs() -> u64 {
    DEFAULT_REFRESH_THRESHOLD_SECS
}

fn default_auth_timeout_secs() -> u64 {
    DEFAULT_AUTH_TIMEOUT_SECS
}

fn default_api_timeout_secs() -> u64 {
    DEFAULT_API_TIMEOUT_SECS
}

impl AuthConfig {
    /// Config with defaults for everything except the backend URL.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            client_id: String::new(),
            redirect_uri: String::new(),
            scope: default_scope(),
            authorize_endpoint: default_authorize_endpoint(),
            api_base_url: api_base_url.into(),
            allowed_domains: Vec::new(),
            refresh_threshold_secs: DEFAULT_REFRESH_THRESHOLD_SECS,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            api_timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Everything login needs: client id, redirect URI, and well-formed URLs.
    pub fn validate_for_login(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::Configuration("client_id is not set".into()));
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(AuthError::Configuration("redirect_uri is not set".into()));
        }
        for (name, value) in [
            ("redirect_uri", &self.redirect_uri),
            ("authorize_endpoint", &self.authorize_endpoint),
        ] {
            reqwest::Url::parse(value)
                .map_err(|e| AuthError::Configuration(format!("{name} is not a valid URL: {e}")))?;
        }
        self.validate_api()
    }

    /// Settings every request needs.
    pub fn validate_api(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            return Err(AuthError::Configuration(format!(
                "api_base_url must start with http:// or https://, got: {}",
                self.api_base_url
            )));
        }
        if self.auth_timeout_secs == 0 || self.api_timeout_secs == 0 {
            return Err(AuthError::Configuration(
                "timeouts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Join a backend path onto `api_base_url`.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
