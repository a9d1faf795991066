//! Shared transport for provider producers.
//!
//! Every live call goes through [`Upstream::get_json`], which applies the
//! service cooldown, adds conditional headers, retries transient failures,
//! classifies the response and keeps backoff state and metrics up to date.

use crate::backoff::BackoffTracker;
use crate::cache::Fetched;
use crate::error::FetchError;
use crate::etag::EtagManager;
use crate::http_retry::{RetryConfig, fetch_with_retry};
use crate::metrics::{MetricField, MetricsRecorder};
use crate::service::Service;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Status and decoded body of an unconditional probe.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Clone)]
pub struct Upstream {
    client: Client,
    retry: RetryConfig,
    backoff: BackoffTracker,
    etags: EtagManager,
    metrics: MetricsRecorder,
}

/// Build the shared HTTP client used for all provider calls.
pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("nowplaying/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .build()
}

impl Upstream {
    pub fn new(
        client: Client,
        retry: RetryConfig,
        backoff: BackoffTracker,
        etags: EtagManager,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            client,
            retry,
            backoff,
            etags,
            metrics,
        }
    }

    pub fn backoff(&self) -> &BackoffTracker {
        &self.backoff
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    async fn record_failure(&self, service: Service, status: Option<u16>) {
        self.metrics.increment(service, MetricField::Errors).await;
        self.backoff.record_error(service, status).await;
    }

    /// Conditional GET returning the decoded JSON body.
    ///
    /// 204 yields `Fetched::Cleared`. 304 yields `Fetched::NotModified`.
    pub async fn get_json(
        &self,
        service: Service,
        url: Url,
        headers: HeaderMap,
    ) -> Result<Fetched<Value>, FetchError> {
        self.get_json_checked(service, url, headers, |_| Ok(())).await
    }

    /// [`Upstream::get_json`] for APIs that report errors inside a 2xx body.
    ///
    /// `check` runs on the decoded body before the call counts as a
    /// success; a rejected body is recorded as a failure and its validator
    /// is not kept. `FetchError::RateLimited` from `check` is treated as a 429.
    pub async fn get_json_checked<F>(
        &self,
        service: Service,
        url: Url,
        headers: HeaderMap,
        check: F,
    ) -> Result<Fetched<Value>, FetchError>
    where
        F: FnOnce(&Value) -> Result<(), FetchError>,
    {
        if self.backoff.should_throttle(service).await {
            debug!("Skipping {} call to {}: cooling down", service, url);
            return Err(FetchError::Throttled(service.as_str()));
        }

        let mut request_headers = headers;
        request_headers.extend(self.etags.request_headers(&url).await);

        self.metrics.increment(service, MetricField::Requests).await;
        let start = Instant::now();

        let response = match fetch_with_retry(&self.client, &url, &request_headers, &self.retry).await
        {
            Ok(response) => response,
            Err(e) => {
                let status = match &e {
                    FetchError::Upstream { status } => Some(*status),
                    _ => None,
                };
                self.metrics.record_call(service, status, start).await;
                self.record_failure(service, status).await;
                return Err(e);
            }
        };

        let status = response.status();
        self.metrics
            .record_call(service, Some(status.as_u16()), start)
            .await;

        match status {
            StatusCode::NOT_MODIFIED => {
                debug!("{} not modified", url);
                self.backoff.record_success(service).await;
                Ok(Fetched::NotModified { url })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.record_failure(service, Some(429)).await;
                Err(FetchError::RateLimited)
            }
            StatusCode::NO_CONTENT => {
                self.backoff.record_success(service).await;
                Ok(Fetched::Cleared)
            }
            s if !s.is_success() => {
                warn!("{} returned HTTP {}", url, s);
                self.record_failure(service, Some(s.as_u16())).await;
                Err(FetchError::Upstream { status: s.as_u16() })
            }
            _ => {
                let response_headers = response.headers().clone();
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Failed to read body from {}: {}", url, e);
                        self.record_failure(service, None).await;
                        return Err(e.into());
                    }
                };
                let value = match serde_json::from_str::<Value>(&body) {
                    Ok(value) => value,
                    Err(e) => {
                        let err = FetchError::malformed(url.as_str(), status.as_u16(), &body);
                        warn!("{} ({})", err, e);
                        self.metrics.increment(service, MetricField::Errors).await;
                        return Err(err);
                    }
                };
                if let Err(e) = check(&value) {
                    let status = matches!(e, FetchError::RateLimited).then_some(429);
                    self.record_failure(service, status).await;
                    return Err(e);
                }
                self.backoff.record_success(service).await;
                self.etags.store_from_response(&url, &response_headers).await;
                Ok(Fetched::Fresh(value))
            }
        }
    }

    /// Single unconditional GET that bypasses validators and retries.
    ///
    /// Used by connection tests; still honours the cooldown so a test
    /// cannot hammer a rate-limited API.
    pub async fn probe(
        &self,
        service: Service,
        url: Url,
        headers: HeaderMap,
    ) -> Result<ProbeResponse, FetchError> {
        if self.backoff.should_throttle(service).await {
            return Err(FetchError::Throttled(service.as_str()));
        }

        let single = RetryConfig {
            max_attempts: 1,
            ..self.retry.clone()
        };
        info!("Probing {} at {}", service, url);
        let response = fetch_with_retry(&self.client, &url, &headers, &single).await?;
        let status = response.status().as_u16();
        if status == 429 {
            self.backoff.record_error(service, Some(429)).await;
            return Err(FetchError::RateLimited);
        }

        let body = response.text().await?;
        let body = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body)
                .map_err(|_| FetchError::malformed(url.as_str(), status, &body))?
        };
        Ok(ProbeResponse { status, body })
    }
}

/// Decode a JSON payload into a typed provider response.
pub fn decode<T: DeserializeOwned>(url: &Url, value: Value) -> Result<T, FetchError> {
    serde_json::from_value::<T>(value.clone())
        .map_err(|_| FetchError::malformed(url.as_str(), 200, &value.to_string()))
}
