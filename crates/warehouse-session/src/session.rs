//! Authentication session state machine
//!
//! One `AuthSession` owns the signed-in state for the process:
//! - `start()` restores a stored pair or clears anything unusable
//! - `begin_login()` / `handle_callback()` run the OAuth redirect flow
//! - `refresh()` renews the credential, single-flight across callers
//! - `logout()` / `force_logout()` end the session
//!
//! The in-memory record is the source for reads; storage is written on every
//! transition so a restart picks up where the process left off. A proactive
//! timer refreshes the credential `refresh_threshold` before it expires.
//!
//! Every logout bumps a generation counter. A login or refresh that started
//! under an older generation is discarded instead of reviving the session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};
use warehouse_auth::{
    AuthApi, AuthConfig, AuthError, Credential, CredentialStore, CsrfGuard, Result, RetryPolicy,
    Session, TokenResponse, UserProfile, build_authorization_url, domain_allowed, now_millis,
    token,
};

use crate::refresh::{RefreshState, RefreshTimer, RefreshTrigger, refresh_delay};

/// Session lifecycle.
///
/// Transitions:
/// - Unauthenticated → Authenticating (`begin_login`)
/// - Authenticating → Authenticated (callback accepted)
/// - Authenticating → Unauthenticated (callback rejected)
/// - Authenticated → Unauthenticated (logout, or refresh failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

impl AuthState {
    pub fn label(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated => "authenticated",
        }
    }
}

/// Called with every error that ends a user-visible operation.
pub type Notifier = Arc<dyn Fn(&AuthError) + Send + Sync>;

/// Query parameters the identity provider appends to the redirect URI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    pub fn new(code: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            state: Some(state.into()),
            ..Self::default()
        }
    }
}

struct Record {
    state: AuthState,
    session: Option<Session>,
    last_error: Option<AuthError>,
    refresh: RefreshState,
    next_refresh_id: u64,
    generation: u64,
    timer: RefreshTimer,
    notifier: Option<Notifier>,
}

pub struct AuthSession {
    config: AuthConfig,
    store: CredentialStore,
    csrf: CsrfGuard,
    api: AuthApi,
    retry: RetryPolicy,
    record: Mutex<Record>,
    this: Weak<AuthSession>,
}

impl AuthSession {
    pub fn new(
        config: AuthConfig,
        store: CredentialStore,
        csrf: CsrfGuard,
        api: AuthApi,
    ) -> Arc<Self> {
        let retry = config.retry.clone();
        Arc::new_cyclic(|this| Self {
            config,
            store,
            csrf,
            api,
            retry,
            record: Mutex::new(Record {
                state: AuthState::Unauthenticated,
                session: None,
                last_error: None,
                refresh: RefreshState::Idle,
                next_refresh_id: 0,
                generation: 0,
                timer: RefreshTimer::new(),
                notifier: None,
            }),
            this: this.clone(),
        })
    }

    pub fn set_notifier(&self, notifier: impl Fn(&AuthError) + Send + Sync + 'static) {
        self.record().notifier = Some(Arc::new(notifier));
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn state(&self) -> AuthState {
        self.record().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.record().session.as_ref().map(|s| s.user.clone())
    }

    /// Credential requests should carry right now.
    pub fn credential(&self) -> Option<Credential> {
        self.record().session.as_ref().map(|s| s.credential.clone())
    }

    pub fn expires_at_ms(&self) -> Option<u64> {
        self.record().session.as_ref().map(|s| s.expires_at_ms)
    }

    /// Most recent error, cleared by a successful login or refresh.
    pub fn last_error(&self) -> Option<AuthError> {
        self.record().last_error.clone()
    }

    pub fn refresh_scheduled(&self) -> bool {
        self.record().timer.is_armed()
    }

    /// Restore the stored session, or clear storage when there is nothing
    /// usable in it.
    pub async fn start(&self) -> AuthState {
        let generation = self.record().generation;
        match self.store.load_session().await {
            Some(session) if !token::is_expired(session.credential.expose(), now_millis()) => {
                info!(user_id = %session.user.id, expires_at_ms = session.expires_at_ms, "restored stored session");
                if self.adopt(session, generation) {
                    return AuthState::Authenticated;
                }
            }
            Some(_) => {
                info!("stored credential has expired, clearing session");
                self.store.clear().await;
            }
            None => {
                debug!("no usable stored session");
                self.store.clear().await;
            }
        }
        self.record().state = AuthState::Unauthenticated;
        AuthState::Unauthenticated
    }

    /// Cancel the proactive refresh timer. The session stays usable.
    pub fn stop(&self) {
        if self.record().timer.cancel() {
            debug!("proactive refresh cancelled");
        }
    }

    /// Issue CSRF state and build the identity-provider redirect.
    pub async fn begin_login(&self) -> Result<Url> {
        let result = async {
            self.config.validate_for_login()?;
            let state = self.csrf.issue().await?;
            build_authorization_url(&self.config, &state)
        }
        .await;

        match result {
            Ok(url) => {
                let mut record = self.record();
                record.state = AuthState::Authenticating;
                record.last_error = None;
                info!("sign-in started");
                Ok(url)
            }
            Err(e) => {
                warn!(code = %e.code(), error = %e, "could not start sign-in");
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Complete sign-in from the identity provider's redirect.
    ///
    /// The CSRF state is checked before anything else; a mismatch never
    /// reaches the backend.
    pub async fn handle_callback(&self, params: CallbackParams) -> Result<UserProfile> {
        let generation = self.record().generation;
        match self.complete_login(params, generation).await {
            Ok(session) => {
                metrics::counter!("auth_login_total", "outcome" => "success").increment(1);
                info!(user_id = %session.user.id, "signed in");
                Ok(session.user)
            }
            Err(e) => {
                metrics::counter!("auth_login_total", "outcome" => "failure").increment(1);
                warn!(code = %e.code(), error = %e, "sign-in failed");
                {
                    let mut record = self.record();
                    record.state = if record.session.is_some() {
                        AuthState::Authenticated
                    } else {
                        AuthState::Unauthenticated
                    };
                }
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn complete_login(&self, params: CallbackParams, generation: u64) -> Result<Session> {
        self.csrf
            .consume(params.state.as_deref().unwrap_or_default())
            .await?;

        if let Some(code) = params.error {
            return Err(AuthError::OAuthProvider {
                code,
                description: params.error_description,
            });
        }
        let code = params
            .code
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                AuthError::InvalidAuthCode("callback did not include an authorization code".into())
            })?;

        let response = self
            .retry
            .run("auth callback", || self.api.exchange_code(&code))
            .await?;
        let session = self.accept(response)?;
        if !self.install(&session, generation).await? {
            return Err(AuthError::Internal("sign-in superseded by logout".into()));
        }
        Ok(session)
    }

    /// Validate a credential/profile pair from the backend.
    fn accept(&self, response: TokenResponse) -> Result<Session> {
        let credential = Credential::new(response.token);
        let Some(expires_at_ms) = credential.expires_at_ms() else {
            return Err(AuthError::Internal(
                "backend issued a malformed credential".into(),
            ));
        };
        if !domain_allowed(self.store.allowed_domains(), &response.user) {
            return Err(AuthError::ForbiddenDomain(format!(
                "{} is not an allowed domain",
                response.user.email_domain().unwrap_or_default()
            )));
        }
        Ok(Session {
            credential,
            user: response.user,
            expires_at_ms,
        })
    }

    /// Persist and adopt `session` if no logout happened since `generation`
    /// was read. A superseded session never touches storage, except to undo
    /// its own write when a logout lands between the write and the adopt.
    async fn install(&self, session: &Session, generation: u64) -> Result<bool> {
        if self.record().generation != generation {
            debug!("discarding session from a superseded generation");
            return Ok(false);
        }
        if !self
            .store
            .save_session(&session.credential, &session.user)
            .await
        {
            return Err(AuthError::Storage("could not persist session".into()));
        }
        if self.adopt(session.clone(), generation) {
            return Ok(true);
        }
        self.undo_write(&session.credential).await;
        Ok(false)
    }

    /// Put storage back in line with memory after a superseded write, if
    /// that write is still what storage holds.
    async fn undo_write(&self, written: &Credential) {
        if self.store.get().await.as_ref() != Some(written) {
            return;
        }
        let live = self.record().session.clone();
        match live {
            Some(live) => {
                if !self.store.save_session(&live.credential, &live.user).await {
                    warn!("could not restore the live session after a superseded write");
                }
            }
            None => self.store.clear().await,
        }
    }

    /// Install `session` and arm the proactive refresh. Refused when a
    /// logout happened since `generation` was read.
    fn adopt(&self, session: Session, generation: u64) -> bool {
        let mut record = self.record();
        if record.generation != generation {
            debug!("discarding session from a superseded generation");
            return false;
        }
        let delay = refresh_delay(
            session.expires_at_ms,
            now_millis(),
            self.config.refresh_threshold(),
        );
        record.state = AuthState::Authenticated;
        record.session = Some(session);
        record.last_error = None;
        self.schedule(&mut record, delay);
        true
    }

    fn schedule(&self, record: &mut Record, delay: Duration) {
        let this = self.this.clone();
        record.timer.arm(delay, async move {
            if let Some(session) = this.upgrade() {
                // Outcome is recorded by the refresh itself
                let _ = session.refresh_with(RefreshTrigger::Scheduled).await;
            }
        });
        debug!(delay_secs = delay.as_secs(), "scheduled proactive refresh");
    }

    /// Renew the credential. Concurrent callers share one backend call.
    pub async fn refresh(&self) -> Result<Session> {
        self.refresh_with(RefreshTrigger::Demand).await
    }

    pub(crate) async fn refresh_with(&self, trigger: RefreshTrigger) -> Result<Session> {
        let handle = {
            let mut record = self.record();
            let joined = match &record.refresh {
                RefreshState::Refreshing { handle, .. } => Some(handle.clone()),
                RefreshState::Idle => None,
            };
            match joined {
                Some(handle) => {
                    metrics::counter!("auth_refresh_waiters_total").increment(1);
                    debug!(trigger = trigger.label(), "joining in-flight refresh");
                    handle
                }
                None => {
                    let Some(this) = self.this.upgrade() else {
                        return Err(AuthError::Internal("session is shutting down".into()));
                    };
                    record.next_refresh_id += 1;
                    let id = record.next_refresh_id;
                    // Runs in its own task so aborting the timer that started
                    // it never cancels a refresh midway.
                    let task = tokio::spawn(async move {
                        let result = this.perform_refresh(trigger).await;
                        this.finish_refresh(id);
                        result
                    });
                    let handle = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(AuthError::Internal(format!("refresh task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    record.refresh = RefreshState::Refreshing {
                        id,
                        handle: handle.clone(),
                    };
                    handle
                }
            }
        };
        handle.await
    }

    fn finish_refresh(&self, id: u64) {
        let mut record = self.record();
        if matches!(record.refresh, RefreshState::Refreshing { id: current, .. } if current == id) {
            record.refresh = RefreshState::Idle;
        }
    }

    async fn perform_refresh(&self, trigger: RefreshTrigger) -> Result<Session> {
        let (generation, credential) = {
            let record = self.record();
            (
                record.generation,
                record.session.as_ref().map(|s| s.credential.clone()),
            )
        };
        let Some(credential) = credential else {
            return Err(AuthError::TokenInvalid("no credential to refresh".into()));
        };

        debug!(trigger = trigger.label(), "refreshing credential");
        match self.renew(&credential, generation).await {
            Ok(session) => {
                metrics::counter!("auth_refresh_total", "outcome" => "success").increment(1);
                info!(
                    trigger = trigger.label(),
                    expires_at_ms = session.expires_at_ms,
                    "credential refreshed"
                );
                Ok(session)
            }
            Err(e) => self.refresh_failed(trigger, generation, e).await,
        }
    }

    async fn renew(&self, credential: &Credential, generation: u64) -> Result<Session> {
        let response = self
            .retry
            .run("auth refresh", || self.api.refresh(credential))
            .await?;
        let session = self.accept(response)?;
        if !self.install(&session, generation).await? {
            return Err(AuthError::TokenInvalid("session ended during refresh".into()));
        }
        Ok(session)
    }

    /// Every refresh failure ends the session. Transient errors have
    /// already been retried by the policy before landing here.
    async fn refresh_failed(
        &self,
        trigger: RefreshTrigger,
        generation: u64,
        err: AuthError,
    ) -> Result<Session> {
        if self.record().generation != generation {
            return Err(err);
        }
        metrics::counter!("auth_refresh_total", "outcome" => "failure").increment(1);
        warn!(
            trigger = trigger.label(),
            code = %err.code(),
            error = %err,
            "refresh failed, ending session"
        );
        self.end_session("forced", None).await;
        self.record_failure(&err);
        Err(err)
    }

    /// Sign out: tell the backend (best effort), then clear local state.
    /// Calling it with no active session does nothing.
    pub async fn logout(&self) {
        let credential = {
            let mut record = self.record();
            record.generation += 1;
            record.timer.cancel();
            record.state = AuthState::Unauthenticated;
            record.last_error = None;
            record.session.take().map(|s| s.credential)
        };
        let credential = match credential {
            Some(c) => Some(c),
            None => self.store.get().await,
        };
        let Some(credential) = credential else {
            // An orphaned profile half may still be stored
            self.store.clear().await;
            debug!("logout with no active session");
            return;
        };

        if let Err(e) = self.api.logout(&credential).await {
            warn!(code = %e.code(), error = %e, "server logout failed, clearing local session anyway");
        }
        self.store.clear().await;
        metrics::counter!("auth_logout_total", "kind" => "user").increment(1);
        info!("signed out");
    }

    /// End the session locally without contacting the backend.
    pub async fn force_logout(&self) {
        self.end_session("forced", None).await;
    }

    /// Like `force_logout`, but only while the session still holds
    /// `credential`. Returns false when the session has moved on.
    pub async fn force_logout_if_current(&self, credential: &Credential) -> bool {
        self.end_session("forced", Some(credential)).await
    }

    async fn end_session(&self, kind: &'static str, expected: Option<&Credential>) -> bool {
        let had_session = {
            let mut record = self.record();
            if let Some(expected) = expected {
                if record.session.as_ref().map(|s| &s.credential) != Some(expected) {
                    debug!("session already moved on, not ending it");
                    return false;
                }
            }
            record.generation += 1;
            record.timer.cancel();
            record.state = AuthState::Unauthenticated;
            record.session.take().is_some()
        };
        self.store.clear().await;
        if had_session {
            metrics::counter!("auth_logout_total", "kind" => kind).increment(1);
            info!(kind, "session ended");
        }
        true
    }

    /// Replace the stored profile for the current credential.
    pub async fn replace_user(&self, user: UserProfile) -> Result<()> {
        let Some(credential) = self.credential() else {
            return Err(AuthError::Unauthorized("not signed in".into()));
        };
        if !self.store.set_user(&user).await {
            return Err(AuthError::Storage("could not persist profile".into()));
        }
        let mut record = self.record();
        if let Some(session) = record.session.as_mut() {
            if session.credential == credential {
                session.user = user;
            }
        }
        Ok(())
    }

    fn record_failure(&self, err: &AuthError) {
        let notifier = {
            let mut record = self.record();
            record.last_error = Some(err.clone());
            record.notifier.clone()
        };
        if let Some(notify) = notifier {
            notify(err);
        }
    }

    #[cfg(test)]
    pub(crate) fn timer_handle(&self) -> Option<tokio::task::AbortHandle> {
        self.record().timer.abort_handle()
    }
}
