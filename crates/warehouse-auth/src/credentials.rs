//! Paired credential + profile storage
//!
//! The bearer credential and the user profile live under two storage keys and
//! are always written and validated as a pair. Every read re-validates, since
//! the two writes are not atomic across a crash. Storage failures never
//! propagate: reads degrade to `None`, writes to `false`. Entries that fail to
//! parse are deleted on the spot so later reads don't keep tripping on them.

use std::sync::Arc;

use common::Secret;
use serde::{Deserialize, Serialize};
use storage::Storage;
use tracing::{debug, info, warn};

use crate::constants::{TOKEN_KEY, USER_KEY};
use crate::token;

/// Opaque bearer credential. Redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Secret<String>);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Secret::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    /// Expiry in epoch milliseconds, when the payload is readable.
    pub fn expires_at_ms(&self) -> Option<u64> {
        token::expires_at_ms(self.expose())
    }

    pub fn is_well_formed(&self) -> bool {
        token::claims(self.expose()).is_some()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential").field(&self.0).finish()
    }
}

/// Signed-in user as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

impl UserProfile {
    /// Lower-cased domain part of the email address.
    pub fn email_domain(&self) -> Option<String> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
    }
}

/// A validated credential/profile pair. Derived on read, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub credential: Credential,
    pub user: UserProfile,
    pub expires_at_ms: u64,
}

/// Check `user` against an allow-list of email domains (empty = allow all).
pub fn domain_allowed(allowed_domains: &[String], user: &UserProfile) -> bool {
    if allowed_domains.is_empty() {
        return true;
    }
    match user.email_domain() {
        Some(domain) => allowed_domains
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(&domain)),
        None => false,
    }
}

/// Credential + profile store over a persistent `Storage` backend.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn Storage>,
    allowed_domains: Vec<String>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn Storage>, allowed_domains: Vec<String>) -> Self {
        Self {
            storage,
            allowed_domains,
        }
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    /// Stored credential, `None` when absent or the backend fails.
    pub async fn get(&self) -> Option<Credential> {
        match self.storage.get(TOKEN_KEY).await {
            Ok(Some(value)) if !value.trim().is_empty() => Some(Credential::new(value)),
            Ok(Some(_)) => {
                self.discard(TOKEN_KEY, "empty credential").await;
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(backend = self.storage.id(), error = %e, "reading credential failed");
                None
            }
        }
    }

    pub async fn set(&self, credential: &Credential) -> bool {
        match self
            .storage
            .set(TOKEN_KEY, credential.expose().to_string())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = self.storage.id(), error = %e, "writing credential failed");
                false
            }
        }
    }

    /// Stored profile. An unparseable entry is deleted and reads as `None`.
    pub async fn get_user(&self) -> Option<UserProfile> {
        let raw = match self.storage.get(USER_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(backend = self.storage.id(), error = %e, "reading user profile failed");
                return None;
            }
        };
        match serde_json::from_str::<UserProfile>(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                self.discard(USER_KEY, &format!("unparseable profile: {e}"))
                    .await;
                None
            }
        }
    }

    pub async fn set_user(&self, user: &UserProfile) -> bool {
        let json = match serde_json::to_string(user) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "serializing user profile failed");
                return false;
            }
        };
        match self.storage.set(USER_KEY, json).await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = self.storage.id(), error = %e, "writing user profile failed");
                false
            }
        }
    }

    /// Write the pair. If the profile write fails the credential is removed
    /// again, so a half-written pair never outlives this call.
    pub async fn save_session(&self, credential: &Credential, user: &UserProfile) -> bool {
        if !self.set(credential).await {
            return false;
        }
        if !self.set_user(user).await {
            warn!("profile write failed after credential write, rolling back");
            self.clear().await;
            return false;
        }
        debug!(user_id = %user.id, "stored session");
        true
    }

    /// Remove both keys. Failures are logged and otherwise ignored.
    pub async fn clear(&self) {
        for key in [TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.storage.remove(key).await {
                warn!(backend = self.storage.id(), key, error = %e, "clearing storage key failed");
            }
        }
        debug!("cleared stored session");
    }

    /// Both halves present and readable, credential structurally sound, and
    /// the profile's domain allowed. A malformed credential is deleted.
    pub async fn validate_integrity(&self) -> bool {
        let credential = self.get().await;
        let user = self.get_user().await;
        match (credential, user) {
            (Some(credential), Some(user)) => self.check_pair(&credential, &user).await,
            (None, None) => false,
            (credential, _) => {
                info!(
                    has_credential = credential.is_some(),
                    "stored session is missing one half"
                );
                false
            }
        }
    }

    /// Read and validate the stored pair as a `Session`.
    pub async fn load_session(&self) -> Option<Session> {
        let credential = self.get().await?;
        let user = self.get_user().await?;
        if !self.check_pair(&credential, &user).await {
            return None;
        }
        let expires_at_ms = credential.expires_at_ms()?;
        Some(Session {
            credential,
            user,
            expires_at_ms,
        })
    }

    async fn check_pair(&self, credential: &Credential, user: &UserProfile) -> bool {
        if !credential.is_well_formed() {
            self.discard(TOKEN_KEY, "malformed credential").await;
            return false;
        }
        if !domain_allowed(&self.allowed_domains, user) {
            warn!(
                user_id = %user.id,
                domain = %user.email_domain().unwrap_or_default(),
                "stored profile domain not in allow-list"
            );
            return false;
        }
        true
    }

    async fn discard(&self, key: &str, reason: &str) {
        warn!(key, reason, "discarding corrupted storage entry");
        if let Err(e) = self.storage.remove(key).await {
            warn!(backend = self.storage.id(), key, error = %e, "deleting corrupted entry failed");
        }
    }
}
