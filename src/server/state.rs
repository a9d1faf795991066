use crate::backoff::{BackoffConfig, BackoffTracker};
use crate::cache::{CacheManager, CachePolicy};
use crate::config::{Config, StoreBackend};
use crate::etag::EtagManager;
use crate::http_retry::RetryConfig;
use crate::metrics::{MetricsRecorder, prometheus_handle};
use crate::provider::lastfm::{LastfmClient, LastfmConfig};
use crate::provider::trakt::{TraktClient, TraktConfig};
use crate::provider::Provider;
use crate::render::Renderer;
use crate::service::Service;
use crate::store::{MemoryStore, Store};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    /// Set when running on the in-memory store, for periodic sweeping
    pub memory_store: Option<MemoryStore>,
    pub cache: CacheManager,
    pub backoff: BackoffTracker,
    pub metrics: MetricsRecorder,
    pub renderer: Renderer,
    pub prometheus: Option<PrometheusHandle>,
    pub started_at: Instant,
}

#[cfg(feature = "valkey")]
async fn connect_valkey(config: &Config) -> Option<Arc<dyn Store>> {
    let Some(url) = &config.valkey_url else {
        warn!("VALKEY_URL is not set, using in-memory store");
        return None;
    };
    match crate::store::ValkeyStore::connect(url).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Valkey unavailable ({}), using in-memory store", e);
            None
        }
    }
}

#[cfg(not(feature = "valkey"))]
async fn connect_valkey(_config: &Config) -> Option<Arc<dyn Store>> {
    warn!("Built without the `valkey` feature, using in-memory store");
    None
}

async fn open_store(config: &Config) -> (Arc<dyn Store>, Option<MemoryStore>) {
    if config.store_backend == StoreBackend::Valkey
        && let Some(store) = connect_valkey(config).await
    {
        return (store, None);
    }

    let memory = MemoryStore::new();
    (Arc::new(memory.clone()), Some(memory))
}

impl AppState {
    /// Wire the store, cache and provider clients from `config`
    pub async fn new(config: Config) -> Self {
        let (store, memory_store) = open_store(&config).await;

        let timeout = Duration::from_secs(config.http_timeout_secs);
        let http_client =
            crate::upstream::build_client(timeout).expect("Failed to create HTTP client");
        let retry = RetryConfig {
            max_attempts: config.http_max_attempts,
            timeout: Some(timeout),
            ..RetryConfig::default()
        };

        let metrics = MetricsRecorder::new(store.clone());
        let etags = EtagManager::new(store.clone());
        let backoff = BackoffTracker::new(store.clone(), BackoffConfig::default());
        let upstream = crate::upstream::Upstream::new(
            http_client,
            retry,
            backoff.clone(),
            etags.clone(),
            metrics.clone(),
        );
        let cache = CacheManager::new(
            store.clone(),
            metrics.clone(),
            etags,
            CachePolicy {
                prefer_fallback: config.prefer_fallback,
            },
        );

        let lastfm = LastfmClient::new(
            LastfmConfig {
                base_url: config.lastfm_base_url.clone(),
                api_key: config.lastfm_api_key.clone(),
                username: config.lastfm_username.clone(),
            },
            upstream.clone(),
        );
        let trakt = TraktClient::new(
            TraktConfig {
                base_url: config.trakt_base_url.clone(),
                client_id: config.trakt_client_id.clone(),
                username: config.trakt_username.clone(),
            },
            upstream,
        );
        info!(
            "Providers configured: lastfm={}, trakt={}",
            lastfm.is_configured(),
            trakt.is_configured()
        );

        Self {
            config: Arc::new(config),
            store,
            memory_store,
            cache,
            backoff,
            metrics,
            renderer: Renderer::new(lastfm, trakt),
            prometheus: prometheus_handle(),
            started_at: Instant::now(),
        }
    }

    pub fn provider(&self, service: Service) -> Option<&dyn Provider> {
        match service {
            Service::Lastfm => Some(self.renderer.lastfm()),
            Service::Trakt => Some(self.renderer.trakt()),
            Service::Generic => None,
        }
    }
}
