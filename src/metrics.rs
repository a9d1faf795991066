//! Per-service request diagnostics.
//!
//! Counters live in the shared [`Store`] so every process contributes to
//! the same totals, and are mirrored into the `metrics` facade for
//! Prometheus scraping. Hourly buckets are updated with a plain
//! read-modify-write; concurrent requests may occasionally undercount a
//! bucket, which is acceptable for display purposes.

use crate::service::Service;
use crate::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::warn;

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder once and return its handle.
///
/// `None` when another recorder was installed first.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

/// Count an HTTP response served by this process.
pub fn record_request(endpoint: &'static str, status: u16) {
    ::metrics::counter!(
        "nowplaying_http_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record handler latency for `endpoint`.
pub fn record_duration(endpoint: &'static str, start: Instant) {
    ::metrics::histogram!("nowplaying_http_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

/// Hourly buckets retained per service (four days).
pub const MAX_BUCKETS: usize = 96;

/// Counter fields tracked per service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricField {
    Requests,
    Errors,
    EtagHits,
    CacheHits,
    FallbackHits,
}

impl MetricField {
    pub const ALL: [MetricField; 5] = [
        MetricField::Requests,
        MetricField::Errors,
        MetricField::EtagHits,
        MetricField::CacheHits,
        MetricField::FallbackHits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Requests => "total_requests",
            MetricField::Errors => "total_errors",
            MetricField::EtagHits => "etag_hits",
            MetricField::CacheHits => "cache_hits",
            MetricField::FallbackHits => "fallback_hits",
        }
    }

    fn prometheus_name(&self) -> &'static str {
        match self {
            MetricField::Requests => "nowplaying_upstream_requests_total",
            MetricField::Errors => "nowplaying_upstream_errors_total",
            MetricField::EtagHits => "nowplaying_etag_hits_total",
            MetricField::CacheHits => "nowplaying_cache_hits_total",
            MetricField::FallbackHits => "nowplaying_fallback_hits_total",
        }
    }
}

/// Last-observed values overwritten on every upstream call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub last_latency_ms: Option<u64>,
    pub last_status_code: Option<u16>,
}

/// Cumulative counters for one service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsCounters {
    pub total_requests: u64,
    pub total_errors: u64,
    pub etag_hits: u64,
    pub cache_hits: u64,
    pub fallback_hits: u64,
    pub last_latency_ms: Option<u64>,
    pub last_status_code: Option<u16>,
}

impl MetricsCounters {
    fn field_mut(&mut self, field: MetricField) -> &mut u64 {
        match field {
            MetricField::Requests => &mut self.total_requests,
            MetricField::Errors => &mut self.total_errors,
            MetricField::EtagHits => &mut self.etag_hits,
            MetricField::CacheHits => &mut self.cache_hits,
            MetricField::FallbackHits => &mut self.fallback_hits,
        }
    }
}

/// Counters for a single wall-clock hour.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub requests: u64,
    pub errors: u64,
    pub etag_hits: u64,
    pub cache_hits: u64,
    pub fallback_hits: u64,
}

impl BucketCounts {
    fn bump(&mut self, field: MetricField) {
        let slot = match field {
            MetricField::Requests => &mut self.requests,
            MetricField::Errors => &mut self.errors,
            MetricField::EtagHits => &mut self.etag_hits,
            MetricField::CacheHits => &mut self.cache_hits,
            MetricField::FallbackHits => &mut self.fallback_hits,
        };
        *slot = slot.saturating_add(1);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HourlyBucket {
    /// UTC hour label, `YYYY-MM-DDTHH`
    pub hour: String,
    #[serde(flatten)]
    pub counts: BucketCounts,
}

fn hour_label(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}

fn counter_key(service: Service, field: MetricField) -> String {
    format!("metrics:{}:{}", service, field.as_str())
}

fn last_key(service: Service) -> String {
    format!("metrics:{}:last", service)
}

fn hourly_key(service: Service) -> String {
    format!("metrics:{}:hourly", service)
}

/// Records per-service counters and hourly time series in the store.
#[derive(Clone)]
pub struct MetricsRecorder {
    store: Arc<dyn Store>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn increment(&self, service: Service, field: MetricField) {
        self.increment_at(service, field, Utc::now()).await;
    }

    /// Increment `field`, attributing the hourly bucket to `at`.
    pub async fn increment_at(&self, service: Service, field: MetricField, at: DateTime<Utc>) {
        ::metrics::counter!(field.prometheus_name(), "service" => service.as_str()).increment(1);

        if let Err(e) = self.store.incr(&counter_key(service, field), 1, None).await {
            warn!("Failed to increment {} for {}: {}", field.as_str(), service, e);
        }
        self.bump_bucket(service, field, at).await;
    }

    async fn bump_bucket(&self, service: Service, field: MetricField, at: DateTime<Utc>) {
        let key = hourly_key(service);
        let mut buckets = self.load_buckets(service).await;
        buckets.entry(hour_label(at)).or_default().bump(field);

        // Labels sort chronologically; evict oldest first
        while buckets.len() > MAX_BUCKETS {
            buckets.pop_first();
        }

        match serde_json::to_string(&buckets) {
            Ok(json) => {
                if let Err(e) = self.store.set(&key, &json, None).await {
                    warn!("Failed to store hourly metrics for {}: {}", service, e);
                }
            }
            Err(e) => warn!("Failed to encode hourly metrics for {}: {}", service, e),
        }
    }

    async fn load_buckets(&self, service: Service) -> BTreeMap<String, BucketCounts> {
        match self.store.get(&hourly_key(service)).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read hourly metrics for {}: {}", service, e);
                BTreeMap::new()
            }
        }
    }

    /// Overwrite the last-observed fields that are present in `update`.
    pub async fn set(&self, service: Service, update: MetricsUpdate) {
        if let Some(ms) = update.last_latency_ms {
            ::metrics::histogram!("nowplaying_upstream_latency_ms", "service" => service.as_str())
                .record(ms as f64);
        }

        let mut last = self.load_last(service).await;
        if update.last_latency_ms.is_some() {
            last.last_latency_ms = update.last_latency_ms;
        }
        if update.last_status_code.is_some() {
            last.last_status_code = update.last_status_code;
        }
        match serde_json::to_string(&last) {
            Ok(json) => {
                if let Err(e) = self.store.set(&last_key(service), &json, None).await {
                    warn!("Failed to store last metrics for {}: {}", service, e);
                }
            }
            Err(e) => warn!("Failed to encode last metrics for {}: {}", service, e),
        }
    }

    /// Record status and elapsed time of an upstream call started at `start`.
    pub async fn record_call(&self, service: Service, status: Option<u16>, start: Instant) {
        self.set(
            service,
            MetricsUpdate {
                last_latency_ms: Some(start.elapsed().as_millis() as u64),
                last_status_code: status,
            },
        )
        .await;
    }

    async fn load_last(&self, service: Service) -> MetricsUpdate {
        match self.store.get(&last_key(service)).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            _ => MetricsUpdate::default(),
        }
    }

    pub async fn snapshot(&self, service: Service) -> MetricsCounters {
        let mut counters = MetricsCounters::default();
        for field in MetricField::ALL {
            let value = match self.store.get(&counter_key(service, field)).await {
                Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0),
                Err(e) => {
                    warn!("Failed to read {} for {}: {}", field.as_str(), service, e);
                    0
                }
            };
            *counters.field_mut(field) = value;
        }
        let last = self.load_last(service).await;
        counters.last_latency_ms = last.last_latency_ms;
        counters.last_status_code = last.last_status_code;
        counters
    }

    /// The most recent `hours` hourly buckets, oldest first, zero-filled.
    pub async fn timeseries(&self, service: Service, hours: usize) -> Vec<HourlyBucket> {
        self.timeseries_at(service, hours, Utc::now()).await
    }

    pub async fn timeseries_at(
        &self,
        service: Service,
        hours: usize,
        now: DateTime<Utc>,
    ) -> Vec<HourlyBucket> {
        let buckets = self.load_buckets(service).await;
        let hours = hours.min(MAX_BUCKETS);
        (0..hours)
            .rev()
            .map(|ago| {
                let hour = hour_label(now - ChronoDuration::hours(ago as i64));
                let counts = buckets.get(&hour).cloned().unwrap_or_default();
                HourlyBucket { hour, counts }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn increments_show_up_in_snapshot() {
        let metrics = recorder();
        metrics.increment(Service::Lastfm, MetricField::Requests).await;
        metrics.increment(Service::Lastfm, MetricField::Requests).await;
        metrics.increment(Service::Lastfm, MetricField::CacheHits).await;
        metrics.increment(Service::Trakt, MetricField::Errors).await;

        let lastfm = metrics.snapshot(Service::Lastfm).await;
        assert_eq!(lastfm.total_requests, 2);
        assert_eq!(lastfm.cache_hits, 1);
        assert_eq!(lastfm.total_errors, 0);

        let trakt = metrics.snapshot(Service::Trakt).await;
        assert_eq!(trakt.total_errors, 1);
    }

    #[tokio::test]
    async fn set_only_overwrites_present_fields() {
        let metrics = recorder();
        metrics
            .set(
                Service::Trakt,
                MetricsUpdate {
                    last_latency_ms: Some(120),
                    last_status_code: Some(200),
                },
            )
            .await;
        metrics
            .set(
                Service::Trakt,
                MetricsUpdate {
                    last_latency_ms: Some(80),
                    last_status_code: None,
                },
            )
            .await;

        let snapshot = metrics.snapshot(Service::Trakt).await;
        assert_eq!(snapshot.last_latency_ms, Some(80));
        assert_eq!(snapshot.last_status_code, Some(200));
    }

    #[tokio::test]
    async fn timeseries_buckets_by_hour() {
        let metrics = recorder();
        let ten = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        let eleven = Utc.with_ymd_and_hms(2026, 3, 1, 11, 5, 0).unwrap();

        metrics
            .increment_at(Service::Lastfm, MetricField::Requests, ten)
            .await;
        metrics
            .increment_at(Service::Lastfm, MetricField::Requests, eleven)
            .await;
        metrics
            .increment_at(Service::Lastfm, MetricField::Errors, eleven)
            .await;

        let series = metrics.timeseries_at(Service::Lastfm, 3, eleven).await;
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].hour, "2026-03-01T09");
        assert_eq!(series[0].counts, BucketCounts::default());
        assert_eq!(series[1].counts.requests, 1);
        assert_eq!(series[2].hour, "2026-03-01T11");
        assert_eq!(series[2].counts.requests, 1);
        assert_eq!(series[2].counts.errors, 1);
    }

    #[tokio::test]
    async fn oldest_buckets_are_pruned() {
        let metrics = recorder();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();

        for hour in 0..(MAX_BUCKETS as i64 + 4) {
            metrics
                .increment_at(
                    Service::Trakt,
                    MetricField::Requests,
                    start + ChronoDuration::hours(hour),
                )
                .await;
        }

        let buckets = metrics.load_buckets(Service::Trakt).await;
        assert_eq!(buckets.len(), MAX_BUCKETS);
        assert_eq!(buckets.keys().next().unwrap(), "2026-03-01T04");
    }
}
