//! Two-tier response cache.
//!
//! Every payload is written twice: a primary entry with the caller's TTL and
//! a fallback entry that lives three times as long (capped at a week). When
//! the upstream is slow, failing or cooling down, the fallback keeps the
//! page populated with the last good data.
//!
//! Lookups go through a [`CacheScope`], created once per incoming request.
//! The scope memoizes every key it resolves, so several fragments needing
//! the same data in one render trigger at most one producer call, and
//! concurrent lookups of the same key within the scope wait on the first.
//! Across requests there is no coalescing: the fallback-preferred policy is
//! what keeps a burst of visitors from stampeding the upstream.

mod entry;
mod key;

pub use entry::{
    CacheEntry, MAX_FALLBACK_TTL, MIN_TTL, clamp_ttl, fallback_ttl, is_empty_payload,
};
pub use key::cache_key;

use crate::error::FetchError;
use crate::etag::EtagManager;
use crate::metrics::{MetricField, MetricsRecorder};
use crate::service::Service;
use crate::store::Store;
use dashmap::DashMap;
use entry::epoch_millis;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use url::Url;

const PRIMARY_PREFIX: &str = "cache:";
const ACCESS_PREFIX: &str = "access:";
const REGISTRY_KEY: &str = "registry:cache-keys";

/// Registry size limit; keys beyond it are cached but not listed.
const MAX_TRACKED_KEYS: usize = 512;

fn primary_key(key: &str) -> String {
    format!("{}{}", PRIMARY_PREFIX, key)
}

fn fallback_key(key: &str) -> String {
    format!("{}{}_fallback", PRIMARY_PREFIX, key)
}

fn access_key(key: &str) -> String {
    format!("{}{}", ACCESS_PREFIX, key)
}

/// Where a lookup's value came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Already resolved earlier in the same scope
    Memory,
    /// Valid primary entry (or a 304 revalidation of the last payload)
    Cache,
    /// Producer returned new data
    Fresh,
    /// Long-lived fallback entry
    Fallback,
    /// Nothing available
    Miss,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Memory => "memory",
            Source::Cache => "cache",
            Source::Fresh => "fresh",
            Source::Fallback => "fallback",
            Source::Miss => "miss",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution context of a lookup; decides whether the network may be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchContext {
    /// Server-side page render. Unbounded in number, so never hits the network.
    PageRender,
    /// Client-triggered refresh (polling or manual)
    Interactive,
    /// Scheduled background refresh
    Background,
}

impl FetchContext {
    pub fn allows_live_fetch(&self) -> bool {
        match self {
            FetchContext::PageRender => false,
            FetchContext::Interactive | FetchContext::Background => true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GetOptions {
    pub context: FetchContext,
    /// Skip the primary entry and the fallback fast path
    pub force_refresh: bool,
    /// Metrics bucket; inferred from the key when `None`
    pub service: Option<Service>,
}

impl GetOptions {
    pub fn new(context: FetchContext) -> Self {
        Self {
            context,
            force_refresh: false,
            service: None,
        }
    }

    pub fn force(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn service(mut self, service: Service) -> Self {
        self.service = Some(service);
        self
    }
}

/// Outcome of a producer call.
#[derive(Debug)]
pub enum Fetched<T> {
    /// New payload
    Fresh(T),
    /// Upstream answered 304 for `url`; keep serving the last payload
    NotModified { url: Url },
    /// Upstream says there is nothing; both tiers are dropped
    Cleared,
}

#[derive(Clone, Debug)]
pub struct CachePolicy {
    /// Serve an existing fallback instead of fetching when the primary
    /// entry has expired. Trades staleness for predictable latency.
    /// Never applied to background refreshes or forced lookups.
    pub prefer_fallback: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            prefer_fallback: true,
        }
    }
}

/// Result of [`CacheScope::get_or_set`].
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: Option<T>,
    pub source: Source,
    pub saved_at: Option<SystemTime>,
    pub expires_at: Option<SystemTime>,
}

impl<T> Cached<T> {
    fn miss() -> Self {
        Self {
            value: None,
            source: Source::Miss,
            saved_at: None,
            expires_at: None,
        }
    }
}

/// Type-erased resolution shared through the scope memo.
#[derive(Debug, Clone)]
struct Resolved {
    value: Option<Value>,
    source: Source,
    saved_at: Option<SystemTime>,
    expires_at: Option<SystemTime>,
}

impl Resolved {
    fn miss() -> Self {
        Self {
            value: None,
            source: Source::Miss,
            saved_at: None,
            expires_at: None,
        }
    }

    fn from_entry(entry: CacheEntry, source: Source) -> Self {
        Self {
            value: Some(entry.value),
            source,
            saved_at: Some(entry.saved_at),
            expires_at: Some(entry.expires_at),
        }
    }
}

/// Metadata about one tracked cache key, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub service: Service,
    pub primary_valid: bool,
    pub saved_at_ms: Option<u64>,
    pub expires_at_ms: Option<u64>,
    pub ttl_secs: Option<u64>,
    pub has_fallback: bool,
    pub fallback_expires_at_ms: Option<u64>,
    pub last_accessed_ms: Option<u64>,
}

/// Shared cache manager. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn Store>,
    metrics: MetricsRecorder,
    etags: EtagManager,
    policy: CachePolicy,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn Store>,
        metrics: MetricsRecorder,
        etags: EtagManager,
        policy: CachePolicy,
    ) -> Self {
        Self {
            store,
            metrics,
            etags,
            policy,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Start a request scope with an empty memo.
    pub fn scope(&self) -> CacheScope {
        CacheScope {
            manager: self.clone(),
            memo: DashMap::new(),
        }
    }

    /// One-off lookup in a throwaway scope.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
        options: GetOptions,
    ) -> Cached<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<T>, FetchError>>,
    {
        self.scope().get_or_set(key, producer, ttl, options).await
    }

    async fn read_entry(&self, store_key: &str) -> Option<CacheEntry> {
        let raw = match self.store.get(store_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Cache read failed for {}: {}", store_key, e);
                return None;
            }
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.is_valid(SystemTime::now()) => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", store_key, e);
                None
            }
        }
    }

    async fn write_entry(&self, store_key: &str, entry: &CacheEntry, ttl: Duration) {
        match serde_json::to_string(entry) {
            Ok(json) => {
                if let Err(e) = self.store.set(store_key, &json, Some(ttl)).await {
                    warn!("Cache write failed for {}: {}", store_key, e);
                }
            }
            Err(e) => warn!("Failed to encode cache entry {}: {}", store_key, e),
        }
    }

    /// Write both tiers after a successful producer call.
    async fn save(&self, key: &str, service: Service, value: Value, ttl: Duration) -> CacheEntry {
        let primary = CacheEntry::new(key, service, value, ttl);
        self.write_entry(&primary_key(key), &primary, ttl).await;

        let fallback_ttl = fallback_ttl(ttl);
        let fallback = CacheEntry::new(key, service, primary.value.clone(), fallback_ttl);
        self.write_entry(&fallback_key(key), &fallback, fallback_ttl)
            .await;

        self.register(key).await;
        debug!(
            "Cached {} for {}s (fallback {}s)",
            key,
            ttl.as_secs(),
            fallback_ttl.as_secs()
        );
        primary
    }

    /// Record the access time without touching the entry's TTL.
    async fn touch(&self, entry: &CacheEntry) {
        let now = epoch_millis::to_millis(&SystemTime::now()).to_string();
        let ttl = fallback_ttl(entry.ttl());
        if let Err(e) = self.store.set(&access_key(&entry.key), &now, Some(ttl)).await {
            debug!("Failed to record access for {}: {}", entry.key, e);
        }
    }

    async fn tracked_keys(&self) -> BTreeSet<String> {
        match self.store.get(REGISTRY_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!("Failed to read cache registry: {}", e);
                BTreeSet::new()
            }
        }
    }

    async fn register(&self, key: &str) {
        let mut keys = self.tracked_keys().await;
        if keys.contains(key) {
            return;
        }
        if keys.len() >= MAX_TRACKED_KEYS {
            debug!("Cache registry full, not tracking {}", key);
            return;
        }
        keys.insert(key.to_string());
        match serde_json::to_string(&keys) {
            Ok(json) => {
                if let Err(e) = self.store.set(REGISTRY_KEY, &json, None).await {
                    warn!("Failed to update cache registry: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode cache registry: {}", e),
        }
    }

    async fn discard(&self, key: &str) {
        for store_key in [primary_key(key), fallback_key(key)] {
            if let Err(e) = self.store.delete(&store_key).await {
                warn!("Failed to drop {}: {}", store_key, e);
            }
        }
    }

    /// Serve the fallback after a failed or empty producer call.
    async fn fall_back(&self, key: &str, service: Service, fallback: Option<CacheEntry>) -> Resolved {
        match fallback {
            Some(entry) => {
                info!("Serving fallback for {}", key);
                self.metrics
                    .increment(service, MetricField::FallbackHits)
                    .await;
                Resolved::from_entry(entry, Source::Fallback)
            }
            None => {
                info!("No data available for {}", key);
                Resolved::miss()
            }
        }
    }

    async fn resolve<P>(&self, key: &str, produce: P, ttl: Duration, options: GetOptions) -> Resolved
    where
        P: Future<Output = Result<Fetched<Value>, FetchError>>,
    {
        let ttl = clamp_ttl(ttl);
        let service = options.service.unwrap_or_else(|| Service::infer(key));
        let force = options.force_refresh;

        let primary = self.read_entry(&primary_key(key)).await;
        if !force && let Some(entry) = &primary {
            debug!("Cache HIT for {}", key);
            self.metrics.increment(service, MetricField::CacheHits).await;
            self.touch(entry).await;
            return Resolved::from_entry(entry.clone(), Source::Cache);
        }

        let fallback = self.read_entry(&fallback_key(key)).await;

        if !force && !options.context.allows_live_fetch() {
            debug!("Live fetch not permitted for {} in {:?}", key, options.context);
            return self.fall_back(key, service, fallback).await;
        }

        if !force
            && self.policy.prefer_fallback
            && options.context != FetchContext::Background
            && let Some(entry) = &fallback
        {
            debug!("Preferring fallback over live fetch for {}", key);
            self.metrics
                .increment(service, MetricField::FallbackHits)
                .await;
            return Resolved::from_entry(entry.clone(), Source::Fallback);
        }

        let outcome = match AssertUnwindSafe(produce).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Producer for {} panicked", key);
                return self.fall_back(key, service, fallback).await;
            }
        };

        match outcome {
            Ok(Fetched::Fresh(value)) if !is_empty_payload(&value) => {
                let entry = self.save(key, service, value, ttl).await;
                Resolved::from_entry(entry, Source::Fresh)
            }
            Ok(Fetched::Fresh(_)) => {
                debug!("Producer for {} returned no data, not caching", key);
                self.fall_back(key, service, fallback).await
            }
            Ok(Fetched::Cleared) => {
                debug!("Upstream reports nothing for {}, dropping both tiers", key);
                self.discard(key).await;
                Resolved::miss()
            }
            Ok(Fetched::NotModified { url }) => {
                self.metrics.increment(service, MetricField::EtagHits).await;
                match primary.or(fallback) {
                    Some(known) => {
                        debug!("{} not modified upstream, extending cache", key);
                        let refreshed = known.extended(ttl);
                        self.write_entry(&primary_key(key), &refreshed, ttl).await;
                        Resolved::from_entry(refreshed, Source::Cache)
                    }
                    None => {
                        warn!(
                            "{} not modified but no payload is cached; dropping validator for {}",
                            key, url
                        );
                        self.etags.forget(&url).await;
                        Resolved::miss()
                    }
                }
            }
            Err(e) => {
                warn!("Producer for {} failed: {}", key, e);
                self.fall_back(key, service, fallback).await
            }
        }
    }

    /// Remove every cache entry, fallback, access stamp and validator.
    pub async fn clear_all(&self) -> usize {
        let mut removed = 0;
        for prefix in [PRIMARY_PREFIX, ACCESS_PREFIX] {
            match self.store.delete_prefix(prefix).await {
                Ok(n) => removed += n,
                Err(e) => warn!("Failed to clear {}*: {}", prefix, e),
            }
        }
        removed += self.etags.clear().await;
        if let Err(e) = self.store.delete(REGISTRY_KEY).await {
            warn!("Failed to clear cache registry: {}", e);
        }
        info!("Cleared {} cache records", removed);
        removed
    }

    /// Metadata for every tracked key.
    pub async fn entries(&self) -> Vec<CacheEntryInfo> {
        let mut infos = Vec::new();
        for key in self.tracked_keys().await {
            let primary = self.read_entry(&primary_key(&key)).await;
            let fallback = self.read_entry(&fallback_key(&key)).await;
            if primary.is_none() && fallback.is_none() {
                continue;
            }
            let last_accessed_ms = match self.store.get(&access_key(&key)).await {
                Ok(value) => value.and_then(|v| v.parse().ok()),
                Err(_) => None,
            };
            let service = primary
                .as_ref()
                .or(fallback.as_ref())
                .map(|e| e.service)
                .unwrap_or_else(|| Service::infer(&key));
            infos.push(CacheEntryInfo {
                service,
                primary_valid: primary.is_some(),
                saved_at_ms: primary.as_ref().map(|e| epoch_millis::to_millis(&e.saved_at)),
                expires_at_ms: primary
                    .as_ref()
                    .map(|e| epoch_millis::to_millis(&e.expires_at)),
                ttl_secs: primary.as_ref().map(|e| e.ttl_secs),
                has_fallback: fallback.is_some(),
                fallback_expires_at_ms: fallback
                    .as_ref()
                    .map(|e| epoch_millis::to_millis(&e.expires_at)),
                last_accessed_ms,
                key,
            });
        }
        infos
    }
}

fn to_json<T: Serialize>(
    key: &str,
    outcome: Result<Fetched<T>, FetchError>,
) -> Result<Fetched<Value>, FetchError> {
    match outcome? {
        Fetched::Fresh(value) => serde_json::to_value(value)
            .map(Fetched::Fresh)
            .map_err(|e| FetchError::malformed(key, 0, &e.to_string())),
        Fetched::NotModified { url } => Ok(Fetched::NotModified { url }),
        Fetched::Cleared => Ok(Fetched::Cleared),
    }
}

/// Per-request view of the cache with memoized lookups.
pub struct CacheScope {
    manager: CacheManager,
    memo: DashMap<String, Arc<OnceCell<Resolved>>>,
}

impl CacheScope {
    /// Return the cached value for `key`, or populate it with `producer`.
    ///
    /// Never fails: producer errors end up as a fallback or a miss.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
        options: GetOptions,
    ) -> Cached<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<T>, FetchError>>,
    {
        let cell = self.memo.entry(key.to_string()).or_default().clone();

        // Only polled if this caller ends up initializing the cell
        let produce = async move { to_json(key, producer().await) };

        let mut initialized_here = false;
        let resolved = cell
            .get_or_init(|| {
                initialized_here = true;
                self.manager.resolve(key, produce, ttl, options)
            })
            .await
            .clone();

        let source = if initialized_here {
            resolved.source
        } else {
            debug!("Memo HIT for {}", key);
            Source::Memory
        };

        let Some(value) = resolved.value else {
            return Cached::miss();
        };
        match serde_json::from_value::<T>(value) {
            Ok(value) => Cached {
                value: Some(value),
                source,
                saved_at: resolved.saved_at,
                expires_at: resolved.expires_at,
            },
            Err(e) => {
                warn!("Cached payload for {} has an unexpected shape: {}", key, e);
                Cached::miss()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(60);

    fn manager_with(store: Arc<MemoryStore>, policy: CachePolicy) -> CacheManager {
        let store: Arc<dyn Store> = store;
        CacheManager::new(
            store.clone(),
            MetricsRecorder::new(store.clone()),
            EtagManager::new(store),
            policy,
        )
    }

    fn manager() -> CacheManager {
        manager_with(Arc::new(MemoryStore::new()), CachePolicy::default())
    }

    fn interactive() -> GetOptions {
        GetOptions::new(FetchContext::Interactive).service(Service::Generic)
    }

    async fn ok(value: Value) -> Result<Fetched<Value>, FetchError> {
        Ok(Fetched::Fresh(value))
    }

    async fn fail() -> Result<Fetched<Value>, FetchError> {
        Err(FetchError::Upstream { status: 500 })
    }

    async fn explode() -> Result<Fetched<Value>, FetchError> {
        panic!("producer bug")
    }

    #[tokio::test]
    async fn cold_key_is_fresh_then_cached() {
        let cache = manager();

        let first = cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;
        assert_eq!(first.source, Source::Fresh);
        assert_eq!(first.value, Some(json!({"a": 1})));

        let second: Cached<Value> = cache
            .get_or_set("k", || fail(), TTL, interactive())
            .await;
        assert_eq!(second.source, Source::Cache);
        assert_eq!(second.value, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn fresh_result_carries_save_metadata() {
        let cache = manager();
        let result = cache
            .get_or_set("k", || ok(json!([1])), TTL, interactive())
            .await;
        let saved = result.saved_at.unwrap();
        let expires = result.expires_at.unwrap();
        assert_eq!(expires.duration_since(saved).unwrap(), TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_primary_falls_back_when_producer_fails() {
        let cache = manager();
        cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;

        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        let result: Cached<Value> = cache
            .get_or_set("k", || fail(), TTL, interactive())
            .await;
        assert_eq!(result.source, Source::Fallback);
        assert_eq!(result.value, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn failure_without_fallback_is_a_miss() {
        let cache = manager();
        let result: Cached<Value> = cache.get_or_set("k", || fail(), TTL, interactive()).await;
        assert_eq!(result.source, Source::Miss);
        assert!(result.value.is_none());
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone(), CachePolicy::default());

        let result = cache
            .get_or_set("k", || ok(json!([])), TTL, interactive())
            .await;
        assert_eq!(result.source, Source::Miss);
        assert_eq!(store.get("cache:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_result_does_not_overwrite_existing_entry() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone(), CachePolicy::default());
        cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;

        let forced = cache
            .get_or_set("k", || ok(json!(null)), TTL, interactive().force(true))
            .await;
        assert_eq!(forced.source, Source::Fallback);
        assert_eq!(forced.value, Some(json!({"a": 1})));

        let again: Cached<Value> = cache.get_or_set("k", || fail(), TTL, interactive()).await;
        assert_eq!(again.source, Source::Cache);
        assert_eq!(again.value, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn cleared_result_drops_both_tiers() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone(), CachePolicy::default());
        cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;

        let cleared: Cached<Value> = cache
            .get_or_set(
                "k",
                || async { Ok(Fetched::Cleared) },
                TTL,
                interactive().force(true),
            )
            .await;
        assert_eq!(cleared.source, Source::Miss);
        assert!(cleared.value.is_none());
        assert_eq!(store.get("cache:k").await.unwrap(), None);

        let after: Cached<Value> = cache.get_or_set("k", || fail(), TTL, interactive()).await;
        assert_eq!(after.source, Source::Miss);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_primary() {
        let cache = manager();
        cache
            .get_or_set("k", || ok(json!({"v": 1})), TTL, interactive())
            .await;

        let forced = cache
            .get_or_set("k", || ok(json!({"v": 2})), TTL, interactive().force(true))
            .await;
        assert_eq!(forced.source, Source::Fresh);
        assert_eq!(forced.value, Some(json!({"v": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn page_render_never_calls_producer() {
        let cache = manager();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let producer = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Fetched::Fresh(json!({"a": 1})))
        };

        let cold: Cached<Value> = cache
            .get_or_set("k", producer, TTL, GetOptions::new(FetchContext::PageRender))
            .await;
        assert_eq!(cold.source, Source::Miss);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        let stale: Cached<Value> = cache
            .get_or_set(
                "k",
                || ok(json!({"a": 2})),
                TTL,
                GetOptions::new(FetchContext::PageRender),
            )
            .await;
        assert_eq!(stale.source, Source::Fallback);
        assert_eq!(stale.value, Some(json!({"a": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn prefer_fallback_skips_fetch_unless_background() {
        let cache = manager();
        cache
            .get_or_set("k", || ok(json!({"v": 1})), TTL, interactive())
            .await;
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        let interactive_read = cache
            .get_or_set("k", || ok(json!({"v": 2})), TTL, interactive())
            .await;
        assert_eq!(interactive_read.source, Source::Fallback);
        assert_eq!(interactive_read.value, Some(json!({"v": 1})));

        let background = cache
            .get_or_set(
                "k",
                || ok(json!({"v": 2})),
                TTL,
                GetOptions::new(FetchContext::Background),
            )
            .await;
        assert_eq!(background.source, Source::Fresh);
        assert_eq!(background.value, Some(json!({"v": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_fallback_preference_fetches_live() {
        let cache = manager_with(
            Arc::new(MemoryStore::new()),
            CachePolicy {
                prefer_fallback: false,
            },
        );
        cache
            .get_or_set("k", || ok(json!({"v": 1})), TTL, interactive())
            .await;
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        let result = cache
            .get_or_set("k", || ok(json!({"v": 2})), TTL, interactive())
            .await;
        assert_eq!(result.source, Source::Fresh);
    }

    #[tokio::test]
    async fn scope_memoizes_within_a_request() {
        let cache = manager();
        let scope = cache.scope();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let result: Cached<Value> = scope
                .get_or_set(
                    "k",
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Fetched::Fresh(json!({"a": 1})))
                    },
                    TTL,
                    interactive().force(true),
                )
                .await;
            assert_eq!(result.value, Some(json!({"a": 1})));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let again: Cached<Value> = scope.get_or_set("k", || fail(), TTL, interactive()).await;
        assert_eq!(again.source, Source::Memory);
    }

    #[tokio::test]
    async fn concurrent_lookups_in_a_scope_share_one_producer_call() {
        let cache = manager();
        let scope = cache.scope();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let producer = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Fetched::Fresh(json!({"a": 1})))
        };

        let (a, b): (Cached<Value>, Cached<Value>) = tokio::join!(
            scope.get_or_set("k", producer, TTL, interactive()),
            scope.get_or_set("k", producer, TTL, interactive()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let mut sources = [a.source, b.source];
        sources.sort_by_key(|s| s.as_str());
        assert_eq!(sources, [Source::Fresh, Source::Memory]);
    }

    #[tokio::test]
    async fn separate_scopes_do_not_share_memo() {
        let cache = manager();
        cache
            .scope()
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;

        let other: Cached<Value> = cache
            .scope()
            .get_or_set("k", || fail(), TTL, interactive())
            .await;
        assert_eq!(other.source, Source::Cache);
    }

    #[tokio::test(start_paused = true)]
    async fn not_modified_extends_last_payload() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(
            store,
            CachePolicy {
                prefer_fallback: false,
            },
        );
        cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        let url = Url::parse("https://api.example.com/feed").unwrap();
        let revalidated: Cached<Value> = cache
            .get_or_set(
                "k",
                || async move { Ok(Fetched::NotModified { url }) },
                TTL,
                interactive(),
            )
            .await;
        assert_eq!(revalidated.source, Source::Cache);
        assert_eq!(revalidated.value, Some(json!({"a": 1})));

        // Primary is valid again without a producer call
        let hit: Cached<Value> = cache.get_or_set("k", || fail(), TTL, interactive()).await;
        assert_eq!(hit.source, Source::Cache);
    }

    #[tokio::test]
    async fn not_modified_without_payload_drops_validator() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone(), CachePolicy::default());
        let etags = EtagManager::new(store.clone());
        let url = Url::parse("https://api.example.com/feed").unwrap();

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::ETAG, "\"v1\"".parse().unwrap());
        etags.store_from_response(&url, &headers).await;

        let target = url.clone();
        let result: Cached<Value> = cache
            .get_or_set(
                "k",
                || async move { Ok(Fetched::NotModified { url: target }) },
                TTL,
                interactive(),
            )
            .await;

        assert_eq!(result.source, Source::Miss);
        assert!(etags.request_headers(&url).await.is_empty());
    }

    #[tokio::test]
    async fn panicking_producer_is_contained() {
        let cache = manager();
        let result: Cached<Value> = cache
            .get_or_set("k", explode, TTL, interactive())
            .await;
        assert_eq!(result.source, Source::Miss);
    }

    #[tokio::test]
    async fn zero_ttl_is_clamped() {
        let cache = manager();
        let result = cache
            .get_or_set("k", || ok(json!({"a": 1})), Duration::ZERO, interactive())
            .await;
        let lifetime = result
            .expires_at
            .unwrap()
            .duration_since(result.saved_at.unwrap())
            .unwrap();
        assert_eq!(lifetime, MIN_TTL);
    }

    #[tokio::test]
    async fn metrics_record_hits() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone(), CachePolicy::default());
        let metrics = MetricsRecorder::new(store);

        cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;
        let _: Cached<Value> = cache.get_or_set("k", || fail(), TTL, interactive()).await;

        assert_eq!(metrics.snapshot(Service::Generic).await.cache_hits, 1);
    }

    #[tokio::test]
    async fn clear_all_removes_both_tiers() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone(), CachePolicy::default());
        cache
            .get_or_set("k", || ok(json!({"a": 1})), TTL, interactive())
            .await;
        assert_eq!(cache.entries().await.len(), 1);

        let removed = cache.clear_all().await;
        assert!(removed >= 2);
        assert!(cache.entries().await.is_empty());

        let after: Cached<Value> = cache.get_or_set("k", || fail(), TTL, interactive()).await;
        assert_eq!(after.source, Source::Miss);
    }

    #[tokio::test]
    async fn entries_report_fallback_metadata() {
        let cache = manager();
        cache
            .get_or_set(
                "lastfm_recent",
                || ok(json!({"a": 1})),
                TTL,
                GetOptions::new(FetchContext::Background),
            )
            .await;

        let entries = cache.entries().await;
        assert_eq!(entries.len(), 1);
        let info = &entries[0];
        assert_eq!(info.key, "lastfm_recent");
        assert_eq!(info.service, Service::Lastfm);
        assert!(info.primary_valid);
        assert!(info.has_fallback);
        assert!(info.fallback_expires_at_ms.unwrap() > info.expires_at_ms.unwrap());
    }
}
