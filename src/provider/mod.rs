//! Provider clients layered on top of the cache.
//!
//! A provider knows its base URL, credentials, default TTLs and response
//! shapes. Normal reads always go through a [`crate::cache::CacheScope`];
//! only the connection test talks to the API directly.

pub mod lastfm;
pub mod trakt;

use crate::service::Service;
use async_trait::async_trait;
use serde::Serialize;

pub use lastfm::LastfmClient;
pub use trakt::TraktClient;

/// Outcome of a provider connection test.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum ConnectionStatus {
    Success(String),
    /// Credentials are missing; nothing was sent
    Warning(String),
    Error(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn service(&self) -> Service;

    fn is_configured(&self) -> bool;

    /// One minimal real call, bypassing the cache.
    async fn test_connection(&self) -> ConnectionStatus;
}
