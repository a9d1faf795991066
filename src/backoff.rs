//! Per-service failure tracking with exponential cooldown.
//!
//! Consecutive upstream errors are counted in the store under a rolling
//! one-hour window. Once the count reaches the threshold the service enters
//! a cooldown window during which no live fetch is attempted. A 429 skips
//! the count and applies the maximum window at once. Any success clears
//! both the window and the count.

use crate::service::Service;
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Consecutive errors before a cooldown starts.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// First cooldown window once the threshold is reached.
pub const DEFAULT_INITIAL_COOLDOWN: Duration = Duration::from_secs(60);

/// Upper bound for any cooldown window.
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Isolated old errors fall out of the count after this long.
pub const ERROR_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub error_threshold: u32,
    pub initial_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            initial_cooldown: DEFAULT_INITIAL_COOLDOWN,
            max_cooldown: DEFAULT_MAX_COOLDOWN,
        }
    }
}

impl BackoffConfig {
    /// Cooldown for `count` consecutive errors, or `None` below the threshold.
    ///
    /// `initial × 2^(count - threshold)`, capped at `max_cooldown`.
    pub fn cooldown_for(&self, count: u32) -> Option<Duration> {
        if count < self.error_threshold {
            return None;
        }
        let exponent = count - self.error_threshold;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        let window = self
            .initial_cooldown
            .checked_mul(factor)
            .unwrap_or(self.max_cooldown);
        Some(window.min(self.max_cooldown))
    }
}

/// Snapshot of a service's backoff bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownState {
    /// Epoch milliseconds until which live fetches are suppressed.
    pub cooldown_until_ms: Option<u64>,
    pub consecutive_error_count: u32,
}

/// Tracks consecutive failures per service in the shared store.
#[derive(Clone)]
pub struct BackoffTracker {
    store: Arc<dyn Store>,
    config: BackoffConfig,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn cooldown_key(service: Service) -> String {
    format!("backoff:cooldown:{}", service)
}

fn errors_key(service: Service) -> String {
    format!("backoff:errors:{}", service)
}

impl BackoffTracker {
    pub fn new(store: Arc<dyn Store>, config: BackoffConfig) -> Self {
        Self { store, config }
    }

    /// `true` while the service is inside a cooldown window.
    ///
    /// Callers check this before any network call and skip the call
    /// entirely, without touching the error count.
    pub async fn should_throttle(&self, service: Service) -> bool {
        match self.cooldown_until(service).await {
            Some(until) => now_ms() < until,
            None => false,
        }
    }

    async fn cooldown_until(&self, service: Service) -> Option<u64> {
        match self.store.get(&cooldown_key(service)).await {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(e) => {
                warn!("Failed to read cooldown for {}: {}", service, e);
                None
            }
        }
    }

    /// Clear cooldown window and error count together.
    pub async fn record_success(&self, service: Service) {
        for key in [cooldown_key(service), errors_key(service)] {
            if let Err(e) = self.store.delete(&key).await {
                warn!("Failed to clear backoff state {}: {}", key, e);
            }
        }
    }

    /// Record a failed call. `status` is `None` for network-level failures.
    ///
    /// Returns the cooldown window that was applied, if any.
    pub async fn record_error(&self, service: Service, status: Option<u16>) -> Option<Duration> {
        if status == Some(429) {
            warn!(
                "{} signalled rate limiting, cooling down for {}s",
                service,
                self.config.max_cooldown.as_secs()
            );
            self.start_cooldown(service, self.config.max_cooldown).await;
            return Some(self.config.max_cooldown);
        }

        let count = match self
            .store
            .incr(&errors_key(service), 1, Some(ERROR_WINDOW))
            .await
        {
            Ok(count) => count.clamp(0, u32::MAX as i64) as u32,
            Err(e) => {
                warn!("Failed to count error for {}: {}", service, e);
                return None;
            }
        };
        debug!("{} consecutive errors for {}", count, service);

        let window = self.config.cooldown_for(count)?;
        warn!(
            "{} failed {} times in a row, cooling down for {}s",
            service,
            count,
            window.as_secs()
        );
        self.start_cooldown(service, window).await;
        Some(window)
    }

    async fn start_cooldown(&self, service: Service, window: Duration) {
        let until = now_ms().saturating_add(window.as_millis() as u64);
        if let Err(e) = self
            .store
            .set(&cooldown_key(service), &until.to_string(), Some(window))
            .await
        {
            warn!("Failed to store cooldown for {}: {}", service, e);
        }
    }

    pub async fn state(&self, service: Service) -> CooldownState {
        let count = match self.store.get(&errors_key(service)).await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0),
            Err(_) => 0,
        };
        CooldownState {
            cooldown_until_ms: self.cooldown_until(service).await,
            consecutive_error_count: count,
        }
    }
}
