use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failure modes of a single upstream call made on behalf of a producer.
///
/// "Not modified" is deliberately absent: a 304 is a success and is
/// reported as [`crate::cache::Fetched::NotModified`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, connection refused, DNS failure, body read failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success status from the provider (other than 429)
    #[error("Upstream returned HTTP {status}")]
    Upstream { status: u16 },

    /// Provider signalled rate limiting (HTTP 429)
    #[error("Upstream rate limit reached")]
    RateLimited,

    /// Error object returned in a successful HTTP response body
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// Local fail-fast while the service is cooling down
    #[error("Service {0} is cooling down")]
    Throttled(&'static str),

    /// Payload could not be decoded or has an unexpected shape
    #[error("Malformed response from {url} (HTTP {status}): {snippet}")]
    MalformedResponse {
        url: String,
        status: u16,
        snippet: String,
    },

    /// Provider credentials are missing
    #[error("Provider {0} is not configured")]
    NotConfigured(&'static str),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl FetchError {
    /// Build a [`FetchError::MalformedResponse`] carrying a truncated body.
    pub fn malformed(url: &str, status: u16, body: &str) -> Self {
        const MAX_SNIPPET: usize = 200;
        let snippet = match body.char_indices().nth(MAX_SNIPPET) {
            Some((idx, _)) => format!("{}…", &body[..idx]),
            None => body.to_string(),
        };
        FetchError::MalformedResponse {
            url: url.to_string(),
            status,
            snippet,
        }
    }
}

/// Key-value store backend failures. Callers log these and degrade.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[cfg(feature = "valkey")]
    #[error("Valkey error: {0}")]
    Valkey(#[from] redis::RedisError),
}

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unknown content: {0}")]
    UnknownContent(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::UnknownContent(_) | AppError::UnknownService(_) => StatusCode::NOT_FOUND,
            AppError::InternalError(_) => {
                error!("{}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
