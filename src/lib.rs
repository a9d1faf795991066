//! Cached Last.fm and Trakt activity fragments.
//!
//! Provider responses go through a two-tier cache (a primary entry plus a
//! long-lived fallback) backed by a pluggable [`store::Store`]. Per-service
//! backoff, conditional requests and metrics keep upstream traffic low,
//! and a change-detecting refresh endpoint lets pages poll cheaply.

pub mod backoff;
pub mod cache;
pub mod change;
pub mod config;
pub mod error;
pub mod etag;
pub mod http_retry;
pub mod metrics;
pub mod poll;
pub mod provider;
pub mod render;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;
pub mod upstream;
