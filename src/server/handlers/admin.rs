//! Operator endpoints: diagnostics, cache clearing, connection tests.

use crate::{
    backoff::CooldownState,
    cache::CacheEntryInfo,
    error::{AppError, Result},
    metrics::{HourlyBucket, MetricsCounters},
    provider::ConnectionStatus,
    server::state::AppState,
    service::Service,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

/// Hours of history returned per service.
const TIMESERIES_HOURS: usize = 24;

#[derive(Serialize)]
pub struct ServiceDiagnostics {
    pub service: Service,
    pub configured: bool,
    pub counters: MetricsCounters,
    pub timeseries: Vec<HourlyBucket>,
    pub cooldown: CooldownState,
    pub throttled: bool,
}

#[derive(Serialize)]
pub struct Diagnostics {
    pub store_backend: &'static str,
    pub prefer_fallback: bool,
    pub services: Vec<ServiceDiagnostics>,
    pub cache_entries: Vec<CacheEntryInfo>,
}

pub async fn diagnostics(State(state): State<AppState>) -> Json<Diagnostics> {
    let mut services = Vec::with_capacity(Service::PROVIDERS.len());
    for service in Service::PROVIDERS {
        services.push(ServiceDiagnostics {
            service,
            configured: state.provider(service).is_some_and(|p| p.is_configured()),
            counters: state.metrics.snapshot(service).await,
            timeseries: state.metrics.timeseries(service, TIMESERIES_HOURS).await,
            cooldown: state.backoff.state(service).await,
            throttled: state.backoff.should_throttle(service).await,
        });
    }

    Json(Diagnostics {
        store_backend: if state.memory_store.is_some() {
            "memory"
        } else {
            "valkey"
        },
        prefer_fallback: state.cache.policy().prefer_fallback,
        services,
        cache_entries: state.cache.entries().await,
    })
}

/// Drop every cached payload, fallback and validator
pub async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    let cleared = state.cache.clear_all().await;
    info!("Cache cleared on request ({} records)", cleared);
    Json(json!({ "cleared": cleared }))
}

/// Run one live call against a provider, bypassing the cache
pub async fn test_provider(
    Path(service): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ConnectionStatus>> {
    let provider = service
        .parse::<Service>()
        .ok()
        .and_then(|s| state.provider(s))
        .ok_or_else(|| AppError::UnknownService(service.clone()))?;

    let status = provider.test_connection().await;
    info!("Connection test for {}: {:?}", service, status);
    Ok(Json(status))
}
