//! End-to-end cache behaviour across provider clients, backoff and the
//! background scheduler, with wiremock standing in for the APIs.

use nowplaying::backoff::{BackoffConfig, BackoffTracker};
use nowplaying::cache::{CacheManager, CachePolicy, FetchContext, GetOptions, Source};
use nowplaying::etag::EtagManager;
use nowplaying::http_retry::RetryConfig;
use nowplaying::metrics::MetricsRecorder;
use nowplaying::provider::lastfm::{LastfmClient, LastfmConfig};
use nowplaying::provider::trakt::{TraktClient, TraktConfig};
use nowplaying::render::{ContentId, Renderer};
use nowplaying::scheduler::Scheduler;
use nowplaying::service::Service;
use nowplaying::store::{MemoryStore, Store};
use nowplaying::upstream::Upstream;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Stack {
    cache: CacheManager,
    backoff: BackoffTracker,
    metrics: MetricsRecorder,
    lastfm: LastfmClient,
    trakt: TraktClient,
}

fn stack(server: &MockServer, policy: CachePolicy) -> Stack {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let metrics = MetricsRecorder::new(store.clone());
    let etags = EtagManager::new(store.clone());
    let backoff = BackoffTracker::new(store.clone(), BackoffConfig::default());
    let upstream = Upstream::new(
        reqwest::Client::new(),
        RetryConfig {
            max_attempts: 1,
            backoff: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(2)),
        },
        backoff.clone(),
        etags.clone(),
        metrics.clone(),
    );
    Stack {
        cache: CacheManager::new(store, metrics.clone(), etags, policy),
        backoff,
        metrics,
        lastfm: LastfmClient::new(
            LastfmConfig {
                base_url: format!("{}/2.0/", server.uri()),
                api_key: Some("key".into()),
                username: Some("rj".into()),
            },
            upstream.clone(),
        ),
        trakt: TraktClient::new(
            TraktConfig {
                base_url: server.uri(),
                client_id: Some("client".into()),
                username: Some("sean".into()),
            },
            upstream,
        ),
    }
}

fn interactive() -> GetOptions {
    GetOptions::new(FetchContext::Interactive)
}

fn history_body() -> serde_json::Value {
    json!([{
        "id": 1,
        "watched_at": "2024-01-01T20:00:00.000Z",
        "action": "watch",
        "type": "movie",
        "movie": {"title": "Heat", "year": 1995, "ids": {"trakt": 1}}
    }])
}

#[tokio::test]
async fn trakt_requests_carry_api_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/sean/history"))
        .and(query_param("limit", "5"))
        .and(header("trakt-api-version", "2"))
        .and(header("trakt-api-key", "client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .expect(1)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());

    let scope = s.cache.scope();
    let history = s.trakt.history(&scope, 5, interactive()).await;
    assert_eq!(history.source, Source::Fresh);
    assert_eq!(history.value.unwrap()[0].media.display_title(), "Heat (1995)");

    // Same scope: served from the memo without another request
    let again = s.trakt.history(&scope, 5, interactive()).await;
    assert_eq!(again.source, Source::Memory);
}

#[tokio::test]
async fn rate_limit_blocks_further_network_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());

    let first = s.trakt.history(&s.cache.scope(), 10, interactive()).await;
    assert_eq!(first.source, Source::Miss);
    assert!(s.backoff.should_throttle(Service::Trakt).await);

    let forced = s
        .trakt
        .history(&s.cache.scope(), 10, interactive().force(true))
        .await;
    assert_eq!(forced.source, Source::Miss);

    // Last.fm is unaffected by Trakt's cooldown
    assert!(!s.backoff.should_throttle(Service::Lastfm).await);
}

#[tokio::test]
async fn rate_limited_service_serves_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());
    s.trakt.history(&s.cache.scope(), 10, interactive()).await;

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let limited = s
        .trakt
        .history(&s.cache.scope(), 10, interactive().force(true))
        .await;
    assert_eq!(limited.source, Source::Fallback);
    assert_eq!(limited.value.unwrap().len(), 1);

    let throttled = s
        .trakt
        .history(&s.cache.scope(), 10, interactive().force(true))
        .await;
    assert_eq!(throttled.source, Source::Fallback);
}

#[tokio::test]
async fn consecutive_errors_escalate_cooldown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());
    let forced = || interactive().force(true);

    for _ in 0..2 {
        s.trakt.history(&s.cache.scope(), 10, forced()).await;
        assert!(!s.backoff.should_throttle(Service::Trakt).await);
    }
    s.trakt.history(&s.cache.scope(), 10, forced()).await;
    assert!(s.backoff.should_throttle(Service::Trakt).await);
    assert_eq!(s.backoff.state(Service::Trakt).await.consecutive_error_count, 3);

    // Cooling down: no request leaves the process
    s.trakt.history(&s.cache.scope(), 10, forced()).await;
    assert_eq!(s.metrics.snapshot(Service::Trakt).await.total_requests, 3);

    // A fourth recorded error doubles the window
    let window = s.backoff.record_error(Service::Trakt, Some(500)).await;
    assert_eq!(window, Some(Duration::from_secs(120)));
}

#[tokio::test]
async fn watching_nothing_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/sean/watching"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());

    for _ in 0..2 {
        let watching = s.trakt.watching(&s.cache.scope(), interactive()).await;
        assert!(watching.value.is_none());
        assert_eq!(watching.source, Source::Miss);
    }
}

#[tokio::test]
async fn ended_watching_session_is_not_resurrected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/sean/watching"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "started_at": "2024-01-01T20:00:00.000Z",
            "action": "watching",
            "type": "movie",
            "movie": {"title": "Heat", "year": 1995, "ids": {"trakt": 1}}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());
    let renderer = Renderer::new(s.lastfm.clone(), s.trakt.clone());

    let playing = renderer
        .render(&s.cache.scope(), ContentId::TraktWatching, interactive())
        .await;
    assert!(playing.live);
    assert!(playing.html.contains("Heat (1995)"));

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/users/sean/watching"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let ended = renderer
        .render(
            &s.cache.scope(),
            ContentId::TraktWatching,
            interactive().force(true),
        )
        .await;
    assert!(!ended.live);
    assert_eq!(ended.source, Source::Miss);
    assert!(!ended.html.contains("Heat"));

    // Nothing left to fall back to on a page render either
    let page = renderer
        .render(
            &s.cache.scope(),
            ContentId::TraktWatching,
            GetOptions::new(FetchContext::PageRender),
        )
        .await;
    assert_eq!(page.source, Source::Miss);
    assert!(!page.live);
}

#[tokio::test]
async fn etag_revalidation_keeps_cached_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("if-none-match", "\"tracks-v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"tracks-v1\"")
                .set_body_json(json!({
                    "recenttracks": {"track": [{"name": "Teardrop", "artist": {"#text": "Massive Attack"}}]}
                })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());

    let fresh = s.lastfm.recent_tracks(&s.cache.scope(), 10, interactive()).await;
    assert_eq!(fresh.source, Source::Fresh);

    let revalidated = s
        .lastfm
        .recent_tracks(&s.cache.scope(), 10, interactive().force(true))
        .await;
    assert_eq!(revalidated.source, Source::Cache);
    assert_eq!(revalidated.value.unwrap()[0].name, "Teardrop");
    assert_eq!(s.metrics.snapshot(Service::Lastfm).await.etag_hits, 1);
}

#[tokio::test]
async fn lastfm_api_errors_count_as_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"error": 29, "message": "Rate limit exceeded"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());

    let result = s.lastfm.recent_tracks(&s.cache.scope(), 10, interactive()).await;
    assert_eq!(result.source, Source::Miss);
    assert!(s.backoff.should_throttle(Service::Lastfm).await);
    assert_eq!(s.metrics.snapshot(Service::Lastfm).await.total_errors, 1);
}

#[tokio::test]
async fn repeated_lastfm_api_errors_start_cooldown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"failed\"")
                .set_body_json(json!({"error": 8, "message": "Operation failed"})),
        )
        .expect(3)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());
    let forced = || interactive().force(true);

    for attempt in 1..=3 {
        let result = s.lastfm.recent_tracks(&s.cache.scope(), 10, forced()).await;
        assert_eq!(result.source, Source::Miss);
        assert_eq!(
            s.backoff.state(Service::Lastfm).await.consecutive_error_count,
            attempt
        );
    }
    assert!(s.backoff.should_throttle(Service::Lastfm).await);

    // Cooling down: further lookups stay local
    s.lastfm.recent_tracks(&s.cache.scope(), 10, forced()).await;
    let counters = s.metrics.snapshot(Service::Lastfm).await;
    assert_eq!(counters.total_requests, 3);
    assert_eq!(counters.total_errors, 3);
}

#[tokio::test]
async fn background_refresh_warms_page_renders() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/2.0/"))
        .and(query_param("method", "user.getrecenttracks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "recenttracks": {"track": [{"name": "Teardrop", "artist": {"#text": "Massive Attack"}}]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/2.0/"))
        .and(query_param("method", "user.gettopartists"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "topartists": {"artist": [{"name": "Massive Attack", "playcount": "42"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/sean/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/sean/watching"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let s = stack(&server, CachePolicy::default());
    let renderer = Renderer::new(s.lastfm.clone(), s.trakt.clone());
    let scheduler = Scheduler::new(
        s.cache.clone(),
        renderer.clone(),
        None,
        Duration::from_secs(300),
    );

    let summary = scheduler.refresh_all().await;
    // Recent and now-playing share one lookup; watching has nothing to show
    assert_eq!(summary.refreshed, 4);
    assert_eq!(summary.failed, 1);

    let page = renderer
        .render(
            &s.cache.scope(),
            ContentId::LastfmTopArtists,
            GetOptions::new(FetchContext::PageRender),
        )
        .await;
    assert_eq!(page.source, Source::Cache);
    assert!(page.html.contains("42 plays"));
}
