//! Backend auth endpoint calls
//!
//! Three JSON endpoints on the dashboard backend:
//! 1. `POST /auth/callback` exchanges an authorization code for `{token, user}`
//! 2. `POST /auth/refresh` renews the bearer credential
//! 3. `POST /auth/logout` ends the server-side session (best effort)
//!
//! `GET /auth/me` is an ordinary authenticated call and goes through the
//! session client so it gets 401 recovery.
//!
//! Each call is a single attempt bounded by the auth timeout; callers wrap
//! them in a `RetryPolicy`.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::{Endpoint, classify_response, classify_transport, parse_retry_after};
use crate::config::AuthConfig;
use crate::constants::{CALLBACK_PATH, LOGOUT_PATH, REFRESH_PATH};
use crate::credentials::{Credential, UserProfile};
use crate::error::{AuthError, Result};

/// Response from both the callback exchange and refresh endpoints.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallbackRequest<'a> {
    code: &'a str,
    redirect_uri: &'a str,
}

/// Client for the backend's auth endpoints.
#[derive(Clone)]
pub struct AuthApi {
    client: reqwest::Client,
    config: AuthConfig,
    timeout: Duration,
}

impl AuthApi {
    pub fn new(client: reqwest::Client, config: AuthConfig) -> Self {
        let timeout = config.auth_timeout();
        Self {
            client,
            config,
            timeout,
        }
    }

    /// Exchange an authorization code for a credential and profile.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        let url = self.config.endpoint(CALLBACK_PATH);
        debug!(%url, "exchanging authorization code");
        let request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&CallbackRequest {
                code,
                redirect_uri: &self.config.redirect_uri,
            });
        let response = send(request, Endpoint::Callback).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Internal(format!("invalid callback response: {e}")))
    }

    /// Renew `credential`.
    pub async fn refresh(&self, credential: &Credential) -> Result<TokenResponse> {
        let url = self.config.endpoint(REFRESH_PATH);
        debug!(%url, "refreshing credential");
        let request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(credential.expose());
        let response = send(request, Endpoint::Refresh).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Internal(format!("invalid refresh response: {e}")))
    }

    /// Tell the backend the session is over.
    pub async fn logout(&self, credential: &Credential) -> Result<()> {
        let url = self.config.endpoint(LOGOUT_PATH);
        let request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(credential.expose());
        send(request, Endpoint::Api).await?;
        Ok(())
    }
}

async fn send(request: reqwest::RequestBuilder, endpoint: Endpoint) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(&e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Err(classify_response(status.as_u16(), retry_after, &body, endpoint))
}
