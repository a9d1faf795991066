pub mod handlers;
pub mod state;

use crate::config::Config;
use crate::scheduler::Scheduler;
use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use state::AppState;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

static VERSION_HEADER: HeaderName = HeaderName::from_static("x-nowplaying-version");

/// Stamp every response with the crate version
async fn version_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        VERSION_HEADER.clone(),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Router over an existing state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/fragment/{content_id}", get(handlers::fragment::serve_fragment))
        .route("/refresh", post(handlers::fragment::refresh_fragment))
        .route("/diagnostics", get(handlers::admin::diagnostics))
        .route("/cache/clear", post(handlers::admin::clear_cache))
        .route(
            "/providers/{service}/test",
            get(handlers::admin::test_provider),
        )
        .route("/metrics", get(handlers::metrics::prometheus_metrics))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(version_header))
        .with_state(state)
}

/// Build the full router from configuration
pub async fn build_router(config: Config) -> Router {
    router(AppState::new(config).await)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let state = AppState::new(config).await;

    let cancel = CancellationToken::new();
    let refresh = match state.config.refresh_interval_secs {
        0 => {
            info!("Background refresh disabled");
            None
        }
        secs => Some(
            Scheduler::new(
                state.cache.clone(),
                state.renderer.clone(),
                state.memory_store.clone(),
                Duration::from_secs(secs),
            )
            .spawn(cancel.clone()),
        ),
    };

    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("🚀 Server listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    if let Some(handle) = refresh
        && let Err(e) = handle.await
    {
        error!("Background refresh task failed: {}", e);
    }

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
