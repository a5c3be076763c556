//! Loopback listener for the OAuth redirect
//!
//! The identity provider sends the browser to `redirect_uri` with `code` and
//! `state` (or `error`) in the query string. The listener binds the
//! redirect URI's host and port, answers the first request on its path, and
//! hands the parameters back to the login command.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};
use warehouse_session::CallbackParams;

use crate::error::{Error, Result};

const DONE_PAGE: &str = "<html><body><h1>Signed in</h1><p>You can close this window and return to the terminal.</p></body></html>";
const STALE_PAGE: &str = "<html><body><h1>Already handled</h1><p>This sign-in has already completed.</p></body></html>";

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type Slot = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

pub struct CallbackListener {
    listener: TcpListener,
    path: String,
}

impl CallbackListener {
    /// Bind the host and port of `redirect_uri`, which must be loopback.
    pub async fn bind(redirect_uri: &str) -> anyhow::Result<Self> {
        let url = Url::parse(redirect_uri).map_err(|e| Error::InvalidRedirect(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidRedirect(redirect_uri.to_string()))?;
        let bind_host = match host {
            "localhost" | "127.0.0.1" => "127.0.0.1",
            "[::1]" => "[::1]",
            _ => return Err(Error::NonLoopbackRedirect(redirect_uri.to_string()).into()),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidRedirect(redirect_uri.to_string()))?;

        let listener = TcpListener::bind(format!("{bind_host}:{port}")).await?;
        debug!(addr = %listener.local_addr()?, path = url.path(), "callback listener bound");
        Ok(Self {
            listener,
            path: url.path().to_string(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the first callback arrives or `timeout` passes.
    pub async fn wait(self, timeout: Duration) -> Result<CallbackParams> {
        let (tx, rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(tx)));
        let app = Router::new()
            .route(&self.path, get(receive))
            .with_state(slot);

        let (stop, stopped) = oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            let shutdown = async {
                let _ = stopped.await;
            };
            if let Err(e) = axum::serve(self.listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                debug!(error = %e, "callback listener stopped");
            }
        });

        let outcome = tokio::time::timeout(timeout, rx).await;
        // Let the confirmation page finish sending before the listener closes
        let _ = stop.send(());
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await.is_err() {
            debug!("callback listener did not drain in time, closing it");
            server.abort();
        }
        match outcome {
            Ok(Ok(params)) => {
                info!(has_error = params.error.is_some(), "received sign-in callback");
                Ok(params)
            }
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::CallbackTimeout(timeout.as_secs())),
        }
    }
}

async fn receive(State(slot): State<Slot>, Query(params): Query<CallbackParams>) -> Html<&'static str> {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    match sender {
        Some(tx) => {
            let _ = tx.send(params);
            Html(DONE_PAGE)
        }
        None => Html(STALE_PAGE),
    }
}
