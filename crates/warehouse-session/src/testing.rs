//! Mock dashboard backend shared by the session and client tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use storage::MemoryStorage;
use tokio::net::TcpListener;
use warehouse_auth::{
    AuthApi, AuthConfig, Credential, CredentialStore, CsrfGuard, RetryPolicy, UserProfile,
    now_millis,
};

use crate::client::AuthenticatedClient;
use crate::session::AuthSession;

pub const TOKEN_TTL_SECS: i64 = 3600;

/// Gap between stale-credential 401s on `/items/{n}`, multiplied by `n`.
pub const STALE_STEP: Duration = Duration::from_millis(30);

/// Work time of an authorized `/slow/{n}` call, multiplied by `3 - n`.
pub const SLOW_STEP: Duration = Duration::from_millis(50);

static NONCE: AtomicUsize = AtomicUsize::new(0);

/// Unsigned JWT-shaped credential expiring `ttl_secs` from now. Every call
/// yields a distinct value.
pub fn token_expiring_in(ttl_secs: i64) -> String {
    let exp = (now_millis() / 1000) as i64 + ttl_secs;
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({ "sub": "u-1", "exp": exp, "jti": NONCE.fetch_add(1, Ordering::SeqCst) })
            .to_string(),
    );
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub fn profile(email: &str) -> UserProfile {
    UserProfile {
        id: "u-1".into(),
        email: email.into(),
        name: "Pat Picker".into(),
        picture: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Succeed,
    Reject,
    Unavailable,
}

pub struct BackendState {
    pub valid_token: Mutex<String>,
    pub refresh_mode: Mutex<RefreshMode>,
    pub refresh_delay: Mutex<Duration>,
    pub logout_fails: AtomicBool,
    pub refresh_calls: AtomicUsize,
    pub callback_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub flaky_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl BackendState {
    fn issue(&self) -> String {
        let token = token_expiring_in(TOKEN_TTL_SECS);
        *self.valid_token.lock().unwrap() = token.clone();
        token
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        bearer(headers).is_some_and(|t| t == *self.valid_token.lock().unwrap())
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        *self.refresh_mode.lock().unwrap() = mode;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn valid_token(&self) -> String {
        self.valid_token.lock().unwrap().clone()
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn callback(
    State(state): State<Arc<BackendState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    state.callback_calls.fetch_add(1, Ordering::SeqCst);
    match body["code"].as_str() {
        Some("bad-code") => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "code already used", "code": "INVALID_AUTH_CODE" })),
        )
            .into_response(),
        Some("outsider") => {
            Json(json!({ "token": state.issue(), "user": profile("eve@elsewhere.example") }))
                .into_response()
        }
        _ => Json(json!({ "token": state.issue(), "user": profile("pat@depot.example") }))
            .into_response(),
    }
}

async fn refresh(State(state): State<Arc<BackendState>>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.refresh_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    let mode = *state.refresh_mode.lock().unwrap();
    match mode {
        RefreshMode::Succeed => {
            Json(json!({ "token": state.issue(), "user": profile("pat@depot.example") }))
                .into_response()
        }
        RefreshMode::Reject => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "refresh token revoked" })),
        )
            .into_response(),
        RefreshMode::Unavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "maintenance" })),
        )
            .into_response(),
    }
}

async fn logout(State(state): State<Arc<BackendState>>) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    if state.logout_fails.load(Ordering::SeqCst) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn me(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "token expired" })))
            .into_response();
    }
    let mut user = profile("pat@depot.example");
    user.name = "Pat Updated".into();
    Json(user).into_response()
}

async fn item(
    State(state): State<Arc<BackendState>>,
    Path(n): Path<u32>,
    headers: HeaderMap,
) -> Response {
    if state.authorized(&headers) {
        return Json(json!({ "item": n, "token": bearer(&headers) })).into_response();
    }
    tokio::time::sleep(STALE_STEP * n).await;
    (StatusCode::UNAUTHORIZED, Json(json!({ "message": "token expired" }))).into_response()
}

async fn remove_item(
    State(state): State<Arc<BackendState>>,
    Path(n): Path<u32>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "token expired" })))
            .into_response();
    }
    if n == 404 {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "no such item" }))).into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Later items answer sooner once authorized, so completion order is the
/// reverse of arrival order.
async fn slow(
    State(state): State<Arc<BackendState>>,
    Path(n): Path<u32>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        tokio::time::sleep(STALE_STEP * n).await;
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "token expired" })))
            .into_response();
    }
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(SLOW_STEP * 3u32.saturating_sub(n)).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    Json(json!({ "item": n })).into_response()
}

async fn revoked() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "message": "access revoked" }))).into_response()
}

async fn flaky(State(state): State<Arc<BackendState>>) -> Response {
    let call = state.flaky_calls.fetch_add(1, Ordering::SeqCst);
    if call < 2 {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
    }
    Json(json!({ "ok": true })).into_response()
}

async fn invalid(State(state): State<Arc<BackendState>>) -> Response {
    state.flaky_calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "message": "bad pick",
            "errors": [{ "field": "qty", "message": "must be positive" }]
        })),
    )
        .into_response()
}

async fn echo(headers: HeaderMap, Json(body): Json<serde_json::Value>) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({ "requestId": request_id, "token": bearer(&headers), "body": body }))
        .into_response()
}

pub struct Backend {
    pub url: String,
    pub state: Arc<BackendState>,
}

impl Backend {
    pub async fn start() -> Self {
        let state = Arc::new(BackendState {
            valid_token: Mutex::new(String::from("none-issued")),
            refresh_mode: Mutex::new(RefreshMode::Succeed),
            refresh_delay: Mutex::new(Duration::ZERO),
            logout_fails: AtomicBool::new(false),
            refresh_calls: AtomicUsize::new(0),
            callback_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            flaky_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        });
        let app = axum::Router::new()
            .route("/auth/callback", post(callback))
            .route("/auth/refresh", post(refresh))
            .route("/auth/logout", post(logout))
            .route("/auth/me", get(me))
            .route("/items/{n}", get(item).delete(remove_item))
            .route("/slow/{n}", get(slow))
            .route("/revoked", get(revoked))
            .route("/flaky", get(flaky))
            .route("/invalid", post(invalid))
            .route("/echo", post(echo).put(echo))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub backend: Backend,
    pub storage: Arc<MemoryStorage>,
    pub session: Arc<AuthSession>,
    pub client: AuthenticatedClient,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(adjust: impl FnOnce(&mut AuthConfig)) -> Harness {
    let backend = Backend::start().await;
    let mut config = AuthConfig::new(backend.url.clone());
    config.client_id = "client-123.apps.googleusercontent.com".into();
    config.redirect_uri = "http://127.0.0.1:8765/callback".into();
    config.retry =
        RetryPolicy::default().with_delays(Duration::from_millis(5), Duration::from_millis(20));
    adjust(&mut config);

    let storage = Arc::new(MemoryStorage::new());
    let store = CredentialStore::new(storage.clone(), config.allowed_domains.clone());
    let csrf = CsrfGuard::new(Arc::new(MemoryStorage::new()));
    let http = reqwest::Client::new();
    let api = AuthApi::new(http.clone(), config.clone());
    let session = AuthSession::new(config, store, csrf, api);
    let client = AuthenticatedClient::new(http, session.clone());
    Harness {
        backend,
        storage,
        session,
        client,
    }
}

impl Harness {
    /// Put a credential/profile pair in persistent storage.
    pub async fn seed(&self, credential: &str) {
        let store = CredentialStore::new(self.storage.clone(), Vec::new());
        assert!(
            store
                .save_session(&Credential::new(credential), &profile("pat@depot.example"))
                .await
        );
    }

    /// Stored credential, read straight from storage.
    pub async fn stored_token(&self) -> Option<String> {
        use storage::Storage;
        self.storage.get(warehouse_auth::TOKEN_KEY).await.unwrap()
    }
}

/// Poll `check` until it holds or three seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
