use crate::http_retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS};
use crate::provider::{lastfm, trakt};
use crate::scheduler::DEFAULT_REFRESH_INTERVAL;
use std::env;

/// Key-value store backend selection
#[derive(Clone, Debug, PartialEq)]
pub enum StoreBackend {
    Memory,
    Valkey,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    pub lastfm_api_key: Option<String>,
    pub lastfm_username: Option<String>,
    pub lastfm_base_url: String,
    pub trakt_client_id: Option<String>,
    pub trakt_username: Option<String>,
    pub trakt_base_url: String,
    pub store_backend: StoreBackend,
    /// Valkey/Redis URL (used when store_backend = Valkey)
    pub valkey_url: Option<String>,
    /// Serve the fallback instead of fetching once the primary entry expired
    pub prefer_fallback: bool,
    /// Background refresh period in seconds (0 disables it)
    pub refresh_interval_secs: u64,
    /// Per-attempt upstream timeout in seconds
    pub http_timeout_secs: u64,
    pub http_max_attempts: u32,
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, PORT defaults to 3000. In PROD mode, it is required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "valkey" | "redis" => StoreBackend::Valkey,
            _ => StoreBackend::Memory,
        };
        let valkey_url = optional("VALKEY_URL");
        if store_backend == StoreBackend::Valkey && valkey_url.is_none() && !is_dev {
            return Err("VALKEY_URL is required when STORE_BACKEND is valkey".into());
        }

        let prefer_fallback = env::var("PREFER_FALLBACK")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let refresh_interval_secs = env::var("REFRESH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REFRESH_INTERVAL.as_secs());

        let http_timeout_secs = env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http_max_attempts = env::var("HTTP_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Ok(Config {
            port,
            is_dev,
            lastfm_api_key: optional("LASTFM_API_KEY"),
            lastfm_username: optional("LASTFM_USERNAME"),
            lastfm_base_url: optional("LASTFM_BASE_URL")
                .unwrap_or_else(|| lastfm::DEFAULT_BASE_URL.to_string()),
            trakt_client_id: optional("TRAKT_CLIENT_ID"),
            trakt_username: optional("TRAKT_USERNAME"),
            trakt_base_url: optional("TRAKT_BASE_URL")
                .unwrap_or_else(|| trakt::DEFAULT_BASE_URL.to_string()),
            store_backend,
            valkey_url,
            prefer_fallback,
            refresh_interval_secs,
            http_timeout_secs,
            http_max_attempts,
        })
    }
}
