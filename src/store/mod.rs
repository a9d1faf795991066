//! Key-value store with per-entry expiration.
//!
//! Every piece of shared mutable state (cache tiers, cooldown flags,
//! metrics counters, validators) lives behind [`Store`], so state survives
//! across requests and, with the Valkey backend, across processes.

#[cfg(feature = "valkey")]
mod valkey;

#[cfg(feature = "valkey")]
pub use valkey::ValkeyStore;

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Durable key-value storage with optional TTL per entry.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a live (unexpired) value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value; `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Atomically add `by` to an integer counter, creating it at zero.
    ///
    /// `ttl` is applied only when the counter is created, so a counter
    /// expires relative to its first increment.
    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, StoreError>;
}

#[derive(Clone, Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process store backed by a [`DashMap`].
///
/// Expiry uses tokio's clock, so tests can move time with
/// `tokio::time::advance`.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Call periodically.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    /// Number of stored entries, including ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(Instant::now()) {
                return Ok(Some(entry.value.clone()));
            }
            // Expired: drop the read guard before removing
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                value: "0".to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            });

        if !entry.is_live(now) {
            entry.value = "0".to_string();
            entry.expires_at = ttl.map(|ttl| now + ttl);
        }

        let current: i64 = entry.value.parse().map_err(|_| {
            StoreError::Backend(format!("value at {} is not an integer", key))
        })?;
        let next = current.saturating_add(by);
        entry.value = next.to_string();
        Ok(next)
    }
}
