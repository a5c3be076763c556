//! Authenticated HTTP client for the dashboard backend
//!
//! Request path:
//! 1. Attach the current credential and an `x-request-id`
//! 2. Retry transient failures per the session's `RetryPolicy`
//! 3. On 401, recover instead of failing:
//!    - the credential already changed since the request was sent: replay now
//!    - a refresh is running: queue behind it
//!    - otherwise: queue first and start the refresh
//! 4. When the refresh lands, queued requests replay together and each
//!    caller gets its own result, handed out in arrival order. When it fails, every queued caller
//!    gets the same error and the session is ended.
//!
//! A replayed request that gets another 401 fails; it does not refresh again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesOrdered;
use reqwest::Url;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};
use warehouse_auth::{
    AuthError, Credential, Endpoint, ME_PATH, Result, RetryPolicy, UserProfile,
    classify_response, classify_transport, parse_retry_after,
};

use crate::request::{ApiRequest, ApiResponse, REQUEST_ID_HEADER};
use crate::session::AuthSession;

struct Pending {
    request: ApiRequest,
    settle: oneshot::Sender<Result<ApiResponse>>,
}

#[derive(Default)]
struct ReplayQueue {
    refreshing: bool,
    pending: VecDeque<Pending>,
}

enum Recovery {
    Reject,
    Replay(ApiRequest, Credential),
    Queued { lead: bool },
}

struct Inner {
    http: reqwest::Client,
    session: Arc<AuthSession>,
    retry: RetryPolicy,
    timeout: Duration,
    queue: Mutex<ReplayQueue>,
}

/// Cheap to clone; clones share one replay queue.
#[derive(Clone)]
pub struct AuthenticatedClient {
    inner: Arc<Inner>,
}

impl AuthenticatedClient {
    pub fn new(http: reqwest::Client, session: Arc<AuthSession>) -> Self {
        let retry = session.config().retry.clone();
        let timeout = session.config().api_timeout();
        Self {
            inner: Arc::new(Inner {
                http,
                session,
                retry,
                timeout,
                queue: Mutex::new(ReplayQueue::default()),
            }),
        }
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.inner.session
    }

    #[instrument(skip_all, fields(request_id = %request.request_id(), method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let credential = self.inner.session.credential();
        match self.inner.dispatch(&request, credential.as_ref()).await {
            Err(AuthError::Unauthorized(message)) => {
                self.recover(request, credential, message).await
            }
            other => other,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::post(path).json(body)?).await?.json()
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::put(path).json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }

    /// Fetch the current profile and store it alongside the credential.
    pub async fn fetch_profile(&self) -> Result<UserProfile> {
        let user: UserProfile = self.get_json(ME_PATH).await?;
        self.inner.session.replace_user(user.clone()).await?;
        Ok(user)
    }

    async fn recover(
        &self,
        request: ApiRequest,
        used: Option<Credential>,
        message: String,
    ) -> Result<ApiResponse> {
        let (settle, settled) = oneshot::channel();
        let recovery = {
            let mut queue = self.inner.queue();
            // Checked under the queue lock: a drain finishing concurrently
            // has already installed the new credential.
            match self.inner.session.credential() {
                None => Recovery::Reject,
                Some(current) if used.as_ref() != Some(&current) => {
                    Recovery::Replay(request, current)
                }
                Some(_) => {
                    queue.pending.push_back(Pending { request, settle });
                    let lead = !queue.refreshing;
                    queue.refreshing = true;
                    Recovery::Queued { lead }
                }
            }
        };

        match recovery {
            Recovery::Reject => Err(AuthError::Unauthorized(message)),
            Recovery::Replay(request, credential) => {
                debug!("credential renewed since request was sent, replaying");
                self.inner.dispatch(&request, Some(&credential)).await
            }
            Recovery::Queued { lead } => {
                if lead {
                    debug!("credential rejected, starting refresh");
                    tokio::spawn(self.clone().drain());
                } else {
                    metrics::counter!("auth_refresh_waiters_total").increment(1);
                    debug!("credential rejected, queued behind refresh");
                }
                settled.await.unwrap_or_else(|_| {
                    Err(AuthError::Internal("request dropped during refresh".into()))
                })
            }
        }
    }

    /// Refresh once, then settle every queued request in arrival order.
    async fn drain(self) {
        let mut reset = QueueReset {
            queue: &self.inner.queue,
            armed: true,
        };

        let started_from = self.inner.session.credential();
        match self.inner.session.refresh().await {
            Ok(_) => loop {
                let batch = {
                    let mut queue = self.inner.queue();
                    if queue.pending.is_empty() {
                        queue.refreshing = false;
                        reset.armed = false;
                        break;
                    }
                    std::mem::take(&mut queue.pending)
                };
                // Replays run concurrently; results are handed out in
                // arrival order.
                let credential = self.inner.session.credential();
                let inner = &self.inner;
                let mut replays: FuturesOrdered<_> = batch
                    .into_iter()
                    .map(|next| {
                        let credential = credential.clone();
                        async move {
                            let result = match &credential {
                                Some(credential) => {
                                    inner.dispatch(&next.request, Some(credential)).await
                                }
                                None => Err(AuthError::Unauthorized(
                                    "signed out during refresh".into(),
                                )),
                            };
                            (next.settle, result)
                        }
                    })
                    .collect();
                while let Some((settle, result)) = replays.next().await {
                    // A closed receiver means the caller stopped waiting
                    let _ = settle.send(result);
                }
            },
            Err(err) => {
                let rejected = {
                    let mut queue = self.inner.queue();
                    queue.refreshing = false;
                    reset.armed = false;
                    std::mem::take(&mut queue.pending)
                };
                warn!(
                    waiting = rejected.len(),
                    code = %err.code(),
                    error = %err,
                    "refresh failed, rejecting queued requests"
                );
                for pending in rejected {
                    let _ = pending.settle.send(Err(err.clone()));
                }
                // A session signed in after this refresh started is not ours to end
                if let Some(credential) = started_from {
                    self.inner.session.force_logout_if_current(&credential).await;
                }
            }
        }
    }
}

/// Clears the in-flight flag if a drain ends without reaching its normal
/// exit, failing whatever is still queued.
struct QueueReset<'a> {
    queue: &'a Mutex<ReplayQueue>,
    armed: bool,
}

impl Drop for QueueReset<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let orphaned = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.refreshing = false;
            std::mem::take(&mut queue.pending)
        };
        for pending in orphaned {
            let _ = pending
                .settle
                .send(Err(AuthError::Internal("refresh cycle aborted".into())));
        }
    }
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, ReplayQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ApiResponse> {
        let mut attempts = 0u32;
        self.retry
            .run("api request", || {
                attempts += 1;
                if attempts > 1 {
                    metrics::counter!("api_request_retries_total").increment(1);
                }
                self.attempt(request, credential)
            })
            .await
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ApiResponse> {
        let endpoint = self.session.config().endpoint(&request.path);
        let mut url = Url::parse(&endpoint)
            .map_err(|e| AuthError::Configuration(format!("invalid request URL {endpoint}: {e}")))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .timeout(self.timeout)
            .headers(request.headers.clone())
            .header(REQUEST_ID_HEADER, request.request_id());
        if let Some(credential) = credential {
            builder = builder.bearer_auth(credential.expose());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let headers = response.headers().clone();
        if !status.is_success() {
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            let err = classify_response(status.as_u16(), retry_after, &body, Endpoint::Api);
            debug!(status = status.as_u16(), code = %err.code(), "request failed");
            return Err(err);
        }
        let body = response.bytes().await.map_err(|e| classify_transport(&e))?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
