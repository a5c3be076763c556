//! OAuth `state` parameter handling
//!
//! A random state value binds an authorization request to its callback. It is
//! generated when login starts, held in ephemeral storage with its creation
//! time, and consumed exactly once by the callback: the stored value is
//! removed before it is compared, so a replayed callback always fails.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use storage::Storage;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::constants::{CSRF_STATE_KEY, CSRF_STATE_MAX_AGE_SECS};
use crate::error::{AuthError, Result};
use crate::token::now_millis;

/// Generate a random URL-safe state value (32 bytes, base64url, 43 chars).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the identity-provider authorization URL.
pub fn build_authorization_url(config: &AuthConfig, state: &str) -> Result<Url> {
    Url::parse_with_params(
        &config.authorize_endpoint,
        &[
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", config.scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
        ],
    )
    .map_err(|e| AuthError::Configuration(format!("invalid authorize_endpoint: {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingState {
    state: String,
    created_at: u64,
}

/// Issues and consumes pending CSRF state in ephemeral storage.
#[derive(Clone)]
pub struct CsrfGuard {
    storage: Arc<dyn Storage>,
    max_age_ms: u64,
}

impl CsrfGuard {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            max_age_ms: CSRF_STATE_MAX_AGE_SECS * 1000,
        }
    }

    pub fn with_max_age(mut self, max_age: std::time::Duration) -> Self {
        self.max_age_ms = max_age.as_millis() as u64;
        self
    }

    /// Generate and persist a fresh state, replacing any pending one.
    pub async fn issue(&self) -> Result<String> {
        let state = generate_state();
        let pending = PendingState {
            state: state.clone(),
            created_at: now_millis(),
        };
        let json = serde_json::to_string(&pending)
            .map_err(|e| AuthError::Internal(format!("serializing CSRF state: {e}")))?;
        self.storage
            .set(CSRF_STATE_KEY, json)
            .await
            .map_err(|e| AuthError::Storage(format!("persisting CSRF state: {e}")))?;
        debug!("issued CSRF state");
        Ok(state)
    }

    /// Consume the pending state and check it against the callback's value.
    pub async fn consume(&self, received: &str) -> Result<()> {
        let stored = self.storage.get(CSRF_STATE_KEY).await;
        if let Err(e) = self.storage.remove(CSRF_STATE_KEY).await {
            warn!(error = %e, "removing CSRF state failed");
        }

        let raw = match stored {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Err(AuthError::CsrfValidation(
                    "no sign-in attempt is pending".into(),
                ));
            }
            Err(e) => {
                return Err(AuthError::CsrfValidation(format!(
                    "pending state unreadable: {e}"
                )));
            }
        };
        let pending: PendingState = serde_json::from_str(&raw)
            .map_err(|e| AuthError::CsrfValidation(format!("pending state corrupt: {e}")))?;

        if !constant_time_eq(pending.state.as_bytes(), received.as_bytes()) {
            warn!("callback state does not match pending state");
            return Err(AuthError::CsrfValidation("state mismatch".into()));
        }
        let age = now_millis().saturating_sub(pending.created_at);
        if age > self.max_age_ms {
            return Err(AuthError::CsrfValidation(format!(
                "sign-in attempt expired after {}s",
                age / 1000
            )));
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
