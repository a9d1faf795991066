//! Conditional-request validators keyed by upstream URL.
//!
//! Validators are keyed by the normalised request URL rather than by the
//! logical cache key, since two logical entries can share an upstream URL.

use crate::store::Store;
use reqwest::header::{ETAG, HeaderMap, HeaderValue, IF_NONE_MATCH};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// How long a validator is remembered.
pub const ETAG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Store key prefix for validators.
pub const ETAG_PREFIX: &str = "etag:";

/// Scheme, host, port and path with the query pairs sorted.
pub fn normalize_url(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut normalized = format!(
        "{}://{}",
        url.scheme(),
        url.host_str().unwrap_or_default().to_ascii_lowercase()
    );
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path());

    if !pairs.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        normalized.push('?');
        normalized.push_str(&query);
    }
    normalized
}

fn etag_key(url: &Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    format!("{}{}", ETAG_PREFIX, hex::encode(hasher.finalize()))
}

/// Remembers the last `ETag` seen per URL and turns it into `If-None-Match`.
#[derive(Clone)]
pub struct EtagManager {
    store: Arc<dyn Store>,
}

impl EtagManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Conditional headers for the next request to `url` (possibly empty).
    pub async fn request_headers(&self, url: &Url) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self.store.get(&etag_key(url)).await {
            Ok(Some(etag)) => match HeaderValue::from_str(&etag) {
                Ok(value) => {
                    debug!("Sending If-None-Match {} for {}", etag, url);
                    headers.insert(IF_NONE_MATCH, value);
                }
                Err(_) => warn!("Ignoring unusable stored ETag for {}", url),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to read ETag for {}: {}", url, e),
        }
        headers
    }

    /// Remember the response's `ETag`, if it sent one.
    pub async fn store_from_response(&self, url: &Url, headers: &HeaderMap) {
        let Some(etag) = headers.get(ETAG).and_then(|v| v.to_str().ok()) else {
            return;
        };
        if etag.is_empty() {
            return;
        }
        if let Err(e) = self.store.set(&etag_key(url), etag, Some(ETAG_TTL)).await {
            warn!("Failed to store ETag for {}: {}", url, e);
        }
    }

    /// Drop the validator so the next request is unconditional.
    pub async fn forget(&self, url: &Url) {
        if let Err(e) = self.store.delete(&etag_key(url)).await {
            warn!("Failed to forget ETag for {}: {}", url, e);
        }
    }

    /// Remove every stored validator.
    pub async fn clear(&self) -> usize {
        self.store.delete_prefix(ETAG_PREFIX).await.unwrap_or_else(|e| {
            warn!("Failed to clear ETags: {}", e);
            0
        })
    }
}
