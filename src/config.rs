use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;

/// Which browser origins the Hub's own HTTP surface accepts cross-origin
/// requests from.
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

/// Everything the Hub needs to boot: its own listen address, the derived
/// `Server`/`Hub` defaults, and how to reach the Proxy's control plane.
pub struct Config {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub cookie_name: String,
    pub db_path: PathBuf,
    pub pam_service: String,
    pub spawn_timeout: Duration,
    pub proxy_api_url: String,
    pub proxy_public_url: String,
    pub proxy_auth_token: String,
    pub cors_mode: CorsMode,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("HUB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("HUB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let base_url = env::var("HUB_BASE_URL").unwrap_or_else(|_| "/".to_string());
        let cookie_name = env::var("HUB_COOKIE_NAME")
            .unwrap_or_else(|_| crate::constants::DEFAULT_HUB_COOKIE_NAME.to_string());

        let db_path = env::var("HUB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("hub.db"));

        let pam_service = env::var("HUB_PAM_SERVICE")
            .unwrap_or_else(|_| crate::constants::DEFAULT_PAM_SERVICE.to_string());

        let spawn_timeout = env::var("HUB_SPAWN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(crate::constants::DEFAULT_SPAWN_TIMEOUT);

        let proxy_api_url =
            env::var("PROXY_API_URL").expect("PROXY_API_URL must be set (proxy control plane)");
        let proxy_public_url = env::var("PROXY_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://{}:{}/", host, port));
        let proxy_auth_token = env::var("PROXY_AUTH_TOKEN").expect("PROXY_AUTH_TOKEN must be set");

        let cors_mode = match env::var("HUB_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        Self {
            host,
            port,
            base_url,
            cookie_name,
            db_path,
            pam_service,
            spawn_timeout,
            proxy_api_url,
            proxy_public_url,
            proxy_auth_token,
            cors_mode,
        }
    }
}
