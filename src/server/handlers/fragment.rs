use crate::{
    cache::{FetchContext, GetOptions},
    change::{ChangeReport, RefreshRequest, RefreshResponse},
    error::{AppError, Result},
    metrics,
    render::{ContentId, Rendered},
    server::state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
};
use std::time::Instant;
use tracing::{debug, info};

fn parse_content(content_id: &str) -> Result<ContentId> {
    content_id
        .parse()
        .map_err(|_| AppError::UnknownContent(content_id.to_string()))
}

/// Render a fragment for the initial page
///
/// Page renders never reach the upstream APIs: the result comes from the
/// cache, its fallback, or the "no data" placeholder.
pub async fn serve_fragment(
    Path(content_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Rendered>> {
    let start = Instant::now();
    let content = parse_content(&content_id)?;

    let scope = state.cache.scope();
    let rendered = state
        .renderer
        .render(&scope, content, GetOptions::new(FetchContext::PageRender))
        .await;
    info!(
        "Rendered {} from {} (live: {})",
        content, rendered.source, rendered.live
    );

    metrics::record_request("fragment", 200);
    metrics::record_duration("fragment", start);
    Ok(Json(rendered))
}

/// Change-detecting refresh used by polling clients
///
/// Omits the HTML when the content hash matches `previous_hash`, unless the
/// client forced the refresh.
pub async fn refresh_fragment(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>> {
    let start = Instant::now();
    let content = parse_content(&request.content_id)?;

    let options = GetOptions::new(FetchContext::Interactive).force(request.force_refresh);
    let scope = state.cache.scope();
    let rendered = state.renderer.render(&scope, content, options).await;

    let report = ChangeReport::compare(
        rendered.html,
        rendered.hash,
        request.previous_hash.as_deref(),
        request.force_refresh,
    );
    debug!(
        "Refresh of {}: changed={} source={}",
        content, report.changed, rendered.source
    );

    metrics::record_request("refresh", 200);
    metrics::record_duration("refresh", start);
    Ok(Json(RefreshResponse::new(
        report,
        rendered.source,
        rendered.live,
    )))
}
