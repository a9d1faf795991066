//! HTTP GET with bounded retry and linear backoff.
//!
//! Only transient failures are retried: network errors and 5xx responses.
//! Any other status, including 304 and every 4xx, is handed back on the
//! first attempt for the caller to classify.

use crate::error::FetchError;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Default number of fetch attempts (1 initial + 2 retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Default per-attempt timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Configuration for [`fetch_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `backoff × n` before the next try.
    pub backoff: Duration,
    /// Optional per-request timeout applied to each individual attempt.
    ///
    /// When `None`, the client's own timeout applies.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }
}

async fn send_once(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    config: &RetryConfig,
) -> Result<Response, reqwest::Error> {
    let mut request = client.get(url.clone()).headers(headers.clone());
    if let Some(timeout) = config.timeout {
        request = request.timeout(timeout);
    }
    request.send().await
}

/// Fetch a URL via HTTP GET with automatic retry and backoff.
///
/// Returns the first response whose status is below 500. Once all
/// attempts are exhausted, returns [`FetchError::Upstream`] for a final
/// 5xx or [`FetchError::Network`] for a final transport failure.
pub async fn fetch_with_retry(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    config: &RetryConfig,
) -> Result<Response, FetchError> {
    let max_attempts = config.max_attempts.max(1);

    // Attempts 1 through N-1 may retry; the final attempt is handled below.
    for attempt in 1..max_attempts {
        match send_once(client, url, headers, config).await {
            Ok(response) if !response.status().is_server_error() => return Ok(response),

            Ok(response) => {
                warn!(
                    "HTTP fetch returned {} for {} (attempt {}/{})",
                    response.status(),
                    url,
                    attempt,
                    max_attempts
                );
            }

            Err(e) => {
                warn!(
                    "HTTP fetch failed for {} (attempt {}/{}): {}",
                    url, attempt, max_attempts, e
                );
            }
        }

        let delay = config.backoff * attempt;
        warn!("Retrying HTTP fetch in {}ms...", delay.as_millis());
        tokio::time::sleep(delay).await;
    }

    // Final attempt returns directly
    let response = send_once(client, url, headers, config).await.map_err(|e| {
        warn!(
            "HTTP fetch failed for {} (attempt {}/{}): {}",
            url, max_attempts, max_attempts, e
        );
        FetchError::Network(e)
    })?;

    if response.status().is_server_error() {
        warn!(
            "HTTP fetch returned {} for {} (attempt {}/{})",
            response.status(),
            url,
            max_attempts,
            max_attempts
        );
        return Err(FetchError::Upstream {
            status: response.status().as_u16(),
        });
    }

    Ok(response)
}
