//! Trakt watch-activity client.

use super::{ConnectionStatus, Provider};
use crate::cache::{CacheScope, Cached, Fetched, GetOptions, cache_key};
use crate::error::FetchError;
use crate::service::Service;
use crate::upstream::{Upstream, decode};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.trakt.tv";

pub const WATCHING_TTL: Duration = Duration::from_secs(60);
pub const HISTORY_TTL: Duration = Duration::from_secs(300);

const API_VERSION: &str = "2";

#[derive(Debug, Clone, Default)]
pub struct TraktConfig {
    pub base_url: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ids {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trakt: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default)]
    pub ids: Ids,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default)]
    pub ids: Ids,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub season: u32,
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub ids: Ids,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Episode,
}

/// Fields shared by `/watching` and `/history` items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movie: Option<Movie>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show: Option<Show>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<Episode>,
}

impl Media {
    /// "Title (Year)" for movies, "Show S01E02 Title" for episodes.
    pub fn display_title(&self) -> String {
        match self.kind {
            MediaKind::Movie => match &self.movie {
                Some(Movie {
                    title,
                    year: Some(year),
                    ..
                }) => format!("{} ({})", title, year),
                Some(movie) => movie.title.clone(),
                None => "Unknown movie".to_string(),
            },
            MediaKind::Episode => {
                let show = self
                    .show
                    .as_ref()
                    .map(|s| s.title.as_str())
                    .unwrap_or("Unknown show");
                match &self.episode {
                    Some(ep) => {
                        let code = format!("S{:02}E{:02}", ep.season, ep.number);
                        match &ep.title {
                            Some(title) => format!("{} {} {}", show, code, title),
                            None => format!("{} {}", show, code),
                        }
                    }
                    None => show.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watching {
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(flatten)]
    pub media: Media,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: u64,
    pub watched_at: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(flatten)]
    pub media: Media,
}

#[derive(Clone)]
pub struct TraktClient {
    config: TraktConfig,
    upstream: Upstream,
}

impl TraktClient {
    pub fn new(config: TraktConfig, upstream: Upstream) -> Self {
        Self { config, upstream }
    }

    fn credentials(&self) -> Result<(&str, &str), FetchError> {
        match (&self.config.client_id, &self.config.username) {
            (Some(id), Some(user)) if !id.is_empty() && !user.is_empty() => Ok((id, user)),
            _ => Err(FetchError::NotConfigured("trakt")),
        }
    }

    /// `trakt-api-version` and `trakt-api-key` plus a JSON content type.
    pub fn headers(&self) -> Result<HeaderMap, FetchError> {
        let (client_id, _) = self.credentials()?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("trakt-api-version"),
            HeaderValue::from_static(API_VERSION),
        );
        let key = HeaderValue::from_str(client_id)
            .map_err(|_| FetchError::NotConfigured("trakt"))?;
        headers.insert(HeaderName::from_static("trakt-api-key"), key);
        Ok(headers)
    }

    /// `{base}/users/{user}/{path}`.
    pub fn user_url(&self, path: &str) -> Result<Url, FetchError> {
        let (_, user) = self.credentials()?;
        let base = self.config.base_url.trim_end_matches('/');
        let url = if path.is_empty() {
            format!("{}/users/{}", base, user)
        } else {
            format!("{}/users/{}/{}", base, user, path)
        };
        Ok(Url::parse(&url)?)
    }

    async fn fetch_watching(&self) -> Result<Fetched<Watching>, FetchError> {
        let url = self.user_url("watching")?;
        match self
            .upstream
            .get_json(Service::Trakt, url.clone(), self.headers()?)
            .await?
        {
            Fetched::Fresh(value) => Ok(Fetched::Fresh(decode(&url, value)?)),
            Fetched::NotModified { url } => Ok(Fetched::NotModified { url }),
            Fetched::Cleared => {
                debug!("Trakt reports nothing playing");
                Ok(Fetched::Cleared)
            }
        }
    }

    async fn fetch_history(&self, limit: u32) -> Result<Fetched<Vec<HistoryItem>>, FetchError> {
        let mut url = self.user_url("history")?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        match self
            .upstream
            .get_json(Service::Trakt, url.clone(), self.headers()?)
            .await?
        {
            Fetched::Fresh(value) => Ok(Fetched::Fresh(decode(&url, value)?)),
            Fetched::NotModified { url } => Ok(Fetched::NotModified { url }),
            Fetched::Cleared => Ok(Fetched::Cleared),
        }
    }

    fn key(&self, base: &str, params: &[(&str, String)]) -> String {
        let user = self.config.username.clone().unwrap_or_default();
        cache_key(
            base,
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .chain([("user".to_string(), user)]),
        )
    }

    /// What the user is watching right now. A 204 means nothing is playing
    /// and drops any cached session, fallback included.
    pub async fn watching(&self, scope: &CacheScope, options: GetOptions) -> Cached<Watching> {
        let key = self.key("trakt_watching", &[]);
        scope
            .get_or_set(
                &key,
                || self.fetch_watching(),
                WATCHING_TTL,
                options.service(Service::Trakt),
            )
            .await
    }

    pub async fn history(
        &self,
        scope: &CacheScope,
        limit: u32,
        options: GetOptions,
    ) -> Cached<Vec<HistoryItem>> {
        let key = self.key("trakt_history", &[("limit", limit.to_string())]);
        scope
            .get_or_set(
                &key,
                || self.fetch_history(limit),
                HISTORY_TTL,
                options.service(Service::Trakt),
            )
            .await
    }
}

#[async_trait]
impl Provider for TraktClient {
    fn service(&self) -> Service {
        Service::Trakt
    }

    fn is_configured(&self) -> bool {
        self.credentials().is_ok()
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let request = self.user_url("").and_then(|url| Ok((url, self.headers()?)));
        let (url, headers) = match request {
            Ok(request) => request,
            Err(FetchError::NotConfigured(_)) => {
                return ConnectionStatus::Warning(
                    "Trakt client ID or username is not set".to_string(),
                );
            }
            Err(e) => return ConnectionStatus::Error(e.to_string()),
        };

        match self.upstream.probe(Service::Trakt, url, headers).await {
            Ok(probe) if probe.status == 200 => {
                let name = probe
                    .body
                    .get("username")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                info!("Trakt connection test succeeded for {}", name);
                ConnectionStatus::Success(format!("Connected to Trakt as {}", name))
            }
            Ok(probe) => match probe.status {
                401 | 403 => ConnectionStatus::Error("Trakt rejected the client ID".to_string()),
                404 => ConnectionStatus::Error("Trakt user not found or private".to_string()),
                status => ConnectionStatus::Error(format!("Trakt returned HTTP {}", status)),
            },
            Err(e) => ConnectionStatus::Error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn episode_title_includes_show_and_code() {
        let item: HistoryItem = serde_json::from_value(json!({
            "id": 1,
            "watched_at": "2024-01-01T20:00:00.000Z",
            "action": "watch",
            "type": "episode",
            "episode": {"season": 1, "number": 2, "title": "Cat's in the Bag...", "ids": {"trakt": 62085}},
            "show": {"title": "Breaking Bad", "year": 2008, "ids": {"slug": "breaking-bad"}}
        }))
        .unwrap();
        assert_eq!(
            item.media.display_title(),
            "Breaking Bad S01E02 Cat's in the Bag..."
        );
    }

    #[test]
    fn movie_title_includes_year() {
        let watching: Watching = serde_json::from_value(json!({
            "expires_at": "2024-01-01T22:00:00.000Z",
            "started_at": "2024-01-01T20:00:00.000Z",
            "action": "scrobble",
            "type": "movie",
            "movie": {"title": "Heat", "year": 1995, "ids": {"trakt": 1}}
        }))
        .unwrap();
        assert_eq!(watching.media.kind, MediaKind::Movie);
        assert_eq!(watching.media.display_title(), "Heat (1995)");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let item: HistoryItem = serde_json::from_value(json!({
            "id": 9,
            "watched_at": "2024-01-01T20:00:00.000Z",
            "type": "movie",
            "movie": {"title": "Ronin", "ids": {}, "tagline": "x"},
            "extra": true
        }))
        .unwrap();
        assert_eq!(item.media.display_title(), "Ronin");
    }
}
