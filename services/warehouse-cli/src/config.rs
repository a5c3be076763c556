//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! WAREHOUSE_CLIENT_ID and WAREHOUSE_API_URL override the corresponding
//! `[auth]` keys so a shared config file can be pointed at another backend.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warehouse_auth::AuthConfig;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub login: LoginConfig,
}

/// Where the signed-in session is persisted
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Interactive sign-in settings
#[derive(Debug, Deserialize)]
pub struct LoginConfig {
    /// How long to wait for the browser to hit the redirect URI
    #[serde(default = "default_login_timeout")]
    pub timeout_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_login_timeout(),
        }
    }
}

impl LoginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("warehouse-session.json")
}

fn default_login_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(client_id) = std::env::var("WAREHOUSE_CLIENT_ID") {
            config.auth.client_id = client_id;
        }
        if let Ok(url) = std::env::var("WAREHOUSE_API_URL") {
            config.auth.api_base_url = url;
        }

        if config.auth.api_base_url.trim().is_empty() {
            return Err(common::Error::MissingSetting("auth.api_base_url"));
        }
        config
            .auth
            .validate_api()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        if config.login.timeout_secs == 0 {
            return Err(common::Error::Config(
                "login.timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("warehouse.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_overlays() {
        unsafe {
            remove_env("WAREHOUSE_CLIENT_ID");
            remove_env("WAREHOUSE_API_URL");
        }
    }

    fn valid_toml() -> &'static str {
        r#"
[auth]
client_id = "abc.apps.googleusercontent.com"
redirect_uri = "http://127.0.0.1:8765/callback"
api_base_url = "https://wms.example.com/api"
allowed_domains = ["depot.example"]

[auth.retry]
max_retries = 5

[storage]
path = "/var/lib/warehouse/session.json"
"#
    }

    fn write_config(name: &str, contents: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("warehouse-cli-test-{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (dir, path) = write_config("valid", valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.auth.client_id, "abc.apps.googleusercontent.com");
        assert_eq!(config.auth.api_base_url, "https://wms.example.com/api");
        assert_eq!(config.auth.allowed_domains, vec!["depot.example"]);
        assert_eq!(config.auth.retry.max_retries, 5);
        assert_eq!(config.auth.refresh_threshold_secs, 300);
        assert_eq!(
            config.storage.path,
            PathBuf::from("/var/lib/warehouse/session.json")
        );
        assert_eq!(config.login.timeout(), Duration::from_secs(300));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_defaults_for_optional_sections() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (dir, path) = write_config(
            "defaults",
            "[auth]\napi_base_url = \"http://localhost:4000\"\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("warehouse-session.json"));
        assert!(config.auth.client_id.is_empty());
        assert_eq!(config.auth.retry.max_retries, 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let (dir, path) = write_config("invalid", "not valid {{{{ toml");
        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejects_non_http_api_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (dir, path) = write_config("scheme", "[auth]\napi_base_url = \"ftp://wms\"\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("http://"), "got: {err}");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (dir, path) = write_config(
            "timeout",
            "[auth]\napi_base_url = \"https://wms\"\napi_timeout_secs = 0\n",
        );
        assert!(matches!(Config::load(&path), Err(common::Error::Config(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_api_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlays();
        let (dir, path) = write_config("no-url", "[auth]\nclient_id = \"abc\"\n");
        assert!(matches!(
            Config::load(&path),
            Err(common::Error::MissingSetting("auth.api_base_url"))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config("env", valid_toml());

        unsafe {
            set_env("WAREHOUSE_CLIENT_ID", "env-client");
            set_env("WAREHOUSE_API_URL", "http://staging.wms.example.com");
        }
        let config = Config::load(&path).unwrap();
        clear_overlays();

        assert_eq!(config.auth.client_id, "env-client");
        assert_eq!(config.auth.api_base_url, "http://staging.wms.example.com");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_env_supplies_missing_api_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config("env-url", "[auth]\n");

        unsafe { set_env("WAREHOUSE_API_URL", "https://wms.example.com") };
        let config = Config::load(&path);
        clear_overlays();

        assert_eq!(config.unwrap().auth.api_base_url, "https://wms.example.com");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/env/path.toml"));
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("warehouse.toml"));
    }
}
