//! Warehouse dashboard CLI
//!
//! Single binary that:
//! 1. Signs in through the identity provider via a loopback redirect
//! 2. Persists the session and keeps the credential fresh while running
//! 3. Makes authenticated calls against the dashboard backend

mod callback;
mod config;
mod error;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::header::{HeaderName, HeaderValue};
use storage::{FileStorage, MemoryStorage};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warehouse_auth::{AuthApi, AuthError, CredentialStore, CsrfGuard, now_millis};
use warehouse_session::{ApiRequest, AuthSession, AuthenticatedClient};

use crate::callback::CallbackListener;
use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "warehouse", version, about = "Warehouse dashboard client")]
struct Cli {
    /// Config file (falls back to CONFIG_PATH, then warehouse.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Write logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in through the browser
    Login,
    /// Sign out and clear the stored session
    Logout,
    /// Show the signed-in user, refreshed from the backend
    Whoami,
    /// Show session state and credential expiry
    Status,
    /// GET a backend path and print the response
    Get {
        path: String,
        /// Extra request header, `Name: value` (repeatable)
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,
    },
}

/// Everything a command needs, built once at startup.
struct App {
    config: Config,
    session: Arc<AuthSession>,
    client: AuthenticatedClient,
}

fn init_tracing(json: bool) {
    // LOG_LEVEL / RUST_LOG support, stderr so command output stays clean
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        api_base_url = %config.auth.api_base_url,
        storage = %config.storage.path.display(),
        "configuration loaded"
    );

    let app = build(config).await?;
    let state = app.session.start().await;
    info!(state = state.label(), "session initialized");

    let outcome = run(&app, cli.command).await;
    app.session.stop();
    outcome
}

async fn build(config: Config) -> Result<App> {
    let persistent = FileStorage::load_or_reset(config.storage.path.clone())
        .await
        .with_context(|| format!("failed to open {}", config.storage.path.display()))?;
    let store = CredentialStore::new(Arc::new(persistent), config.auth.allowed_domains.clone());
    // State only has to survive one login command
    let csrf = CsrfGuard::new(Arc::new(MemoryStorage::new()));

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let api = AuthApi::new(http.clone(), config.auth.clone());
    let session = AuthSession::new(config.auth.clone(), store, csrf, api);
    session.set_notifier(|e| warn!(code = %e.code(), "{}", e.user_message()));
    let client = AuthenticatedClient::new(http, session.clone());

    Ok(App {
        config,
        session,
        client,
    })
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Login => login(app).await,
        Command::Logout => {
            app.session.logout().await;
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => {
            if !app.session.is_authenticated() {
                return Err(error::Error::NotSignedIn.into());
            }
            let user = app.client.fetch_profile().await.map_err(report)?;
            println!("{} <{}>", user.name, user.email);
            Ok(())
        }
        Command::Status => {
            println!("state: {}", app.session.state().label());
            if let Some(user) = app.session.current_user() {
                println!("user:  {} <{}>", user.name, user.email);
            }
            if let Some(expires_at_ms) = app.session.expires_at_ms() {
                let secs = expires_at_ms.saturating_sub(now_millis()) / 1000;
                println!("credential expires in {}m {}s", secs / 60, secs % 60);
            }
            if let Some(err) = app.session.last_error() {
                println!("last error: {} ({})", err.user_message(), err.code());
            }
            Ok(())
        }
        Command::Get { path, headers } => {
            let mut request = ApiRequest::get(path);
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                request = request.header(name, value);
            }
            let response = app.client.send(request).await.map_err(report)?;
            match response.json::<serde_json::Value>() {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                Err(_) => println!("{}", response.text()),
            }
            Ok(())
        }
    }
}

async fn login(app: &App) -> Result<()> {
    let url = app.session.begin_login().await.map_err(report)?;
    let listener = CallbackListener::bind(&app.config.auth.redirect_uri).await?;
    println!("Open this URL in your browser to sign in:\n\n  {url}\n");

    let params = tokio::select! {
        params = listener.wait(app.config.login.timeout()) => params?,
        _ = tokio::signal::ctrl_c() => return Err(error::Error::Cancelled.into()),
    };
    let user = app.session.handle_callback(params).await.map_err(report)?;
    println!("Signed in as {} <{}>", user.name, user.email);
    Ok(())
}

/// Parse a `Name: value` header argument.
fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("header {raw:?} is not in `Name: value` form"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .with_context(|| format!("invalid header name in {raw:?}"))?;
    let value = HeaderValue::from_str(value.trim())
        .with_context(|| format!("invalid header value in {raw:?}"))?;
    Ok((name, value))
}

/// Turn a backend or session error into its user-facing message.
fn report(err: AuthError) -> anyhow::Error {
    if err.requires_reauthentication() {
        return anyhow::anyhow!(
            "{} ({}). Run `warehouse login` to sign in again.",
            err.user_message(),
            err.code()
        );
    }
    anyhow::anyhow!("{} ({})", err.user_message(), err.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "warehouse",
            "get",
            "/items/7",
            "--config",
            "/etc/warehouse.toml",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("/etc/warehouse.toml"));
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Command::Get { ref path, .. } if path == "/items/7"));
    }

    #[test]
    fn get_collects_repeated_headers() {
        let cli = Cli::try_parse_from([
            "warehouse",
            "get",
            "/items",
            "-H",
            "x-zone: A",
            "--header",
            "accept: text/csv",
        ])
        .unwrap();
        let Command::Get { headers, .. } = cli.command else {
            panic!("expected get");
        };
        assert_eq!(headers, vec!["x-zone: A", "accept: text/csv"]);
    }

    #[test]
    fn parse_header_splits_name_and_value() {
        let (name, value) = parse_header("X-Zone:  A-12 ").unwrap();
        assert_eq!(name.as_str(), "x-zone");
        assert_eq!(value.to_str().unwrap(), "A-12");
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header("bad name: v").is_err());
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["warehouse"]).is_err());
    }

    #[test]
    fn report_uses_user_message_and_code() {
        let err = report(AuthError::Forbidden("no".into()));
        assert!(err.to_string().ends_with("(FORBIDDEN)"), "got: {err}");
    }

    #[test]
    fn report_tells_user_to_sign_in_again() {
        let err = report(AuthError::CsrfValidation("state mismatch".into())).to_string();
        assert!(err.contains("(CSRF_MISMATCH)"), "got: {err}");
        assert!(err.ends_with("Run `warehouse login` to sign in again."), "got: {err}");
    }

    #[tokio::test]
    async fn build_wires_session_to_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[auth]\napi_base_url = \"http://127.0.0.1:9\"\n\n[storage]\npath = \"{}\"\n",
            dir.path().join("session.json").display()
        ))
        .unwrap();

        let app = build(config).await.unwrap();
        assert_eq!(
            app.session.start().await,
            warehouse_session::AuthState::Unauthenticated
        );
        assert!(dir.path().join("session.json").exists());
    }
}
