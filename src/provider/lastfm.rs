//! Last.fm scrobble client.

use super::{ConnectionStatus, Provider};
use crate::cache::{CacheScope, Cached, Fetched, GetOptions, cache_key};
use crate::error::FetchError;
use crate::service::Service;
use crate::upstream::{Upstream, decode};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";

pub const RECENT_TRACKS_TTL: Duration = Duration::from_secs(60);
pub const TOP_ARTISTS_TTL: Duration = Duration::from_secs(60 * 60);

/// Last.fm error code for "rate limit exceeded".
const RATE_LIMIT_ERROR: i64 = 29;

#[derive(Debug, Clone, Default)]
pub struct LastfmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub username: Option<String>,
}

/// `{"#text": "..."}` wrapper used for artist and album names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextField {
    #[serde(rename = "#text", default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "#text", default)]
    pub url: String,
    #[serde(default)]
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDate {
    pub uts: String,
    #[serde(rename = "#text", default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackAttr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nowplaying: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    #[serde(default)]
    pub artist: TextField,
    #[serde(default)]
    pub album: TextField,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image: Vec<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<TrackDate>,
    #[serde(rename = "@attr", default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<TrackAttr>,
}

impl Track {
    pub fn is_now_playing(&self) -> bool {
        self.attr
            .as_ref()
            .and_then(|a| a.nowplaying.as_deref())
            .is_some_and(|v| v == "true")
    }

    /// URL of the largest artwork variant, if any.
    pub fn artwork(&self) -> Option<&str> {
        self.image
            .iter()
            .rev()
            .map(|i| i.url.as_str())
            .find(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
    #[serde(default)]
    pub playcount: String,
    #[serde(default)]
    pub url: String,
}

/// Last.fm returns a bare object instead of a one-element array.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

#[derive(Deserialize)]
struct RecentTracksEnvelope {
    recenttracks: RecentTracksBody,
}

#[derive(Deserialize)]
struct RecentTracksBody {
    #[serde(default, deserialize_with = "one_or_many")]
    track: Vec<Track>,
}

#[derive(Deserialize)]
struct TopArtistsEnvelope {
    topartists: TopArtistsBody,
}

#[derive(Deserialize)]
struct TopArtistsBody {
    #[serde(default, deserialize_with = "one_or_many")]
    artist: Vec<Artist>,
}

/// The currently playing track: Last.fm marks it as the first item.
pub fn now_playing(tracks: &[Track]) -> Option<&Track> {
    tracks.first().filter(|t| t.is_now_playing())
}

/// Periods accepted by `user.gettopartists`.
pub const PERIODS: [&str; 6] = ["overall", "7day", "1month", "3month", "6month", "12month"];

/// Reject `{"error": n, "message": "..."}` bodies delivered with a 2xx status.
fn check_api_error(value: &Value) -> Result<(), FetchError> {
    let Some(code) = value.get("error").and_then(Value::as_i64) else {
        return Ok(());
    };
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    warn!("Last.fm API error {}: {}", code, message);
    if code == RATE_LIMIT_ERROR {
        Err(FetchError::RateLimited)
    } else {
        Err(FetchError::Api { code, message })
    }
}

#[derive(Clone)]
pub struct LastfmClient {
    config: LastfmConfig,
    upstream: Upstream,
}

impl LastfmClient {
    pub fn new(config: LastfmConfig, upstream: Upstream) -> Self {
        Self { config, upstream }
    }

    fn credentials(&self) -> Result<(&str, &str), FetchError> {
        match (&self.config.api_key, &self.config.username) {
            (Some(key), Some(user)) if !key.is_empty() && !user.is_empty() => Ok((key, user)),
            _ => Err(FetchError::NotConfigured("lastfm")),
        }
    }

    /// API URL for `method` with the common parameters plus `extra`.
    pub fn request_url(&self, method: &str, extra: &[(&str, String)]) -> Result<Url, FetchError> {
        let (api_key, user) = self.credentials()?;
        let mut url = Url::parse(&self.config.base_url)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("method", method)
                .append_pair("user", user)
                .append_pair("api_key", api_key)
                .append_pair("format", "json");
            for (k, v) in extra {
                query.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn call(
        &self,
        method: &str,
        extra: &[(&str, String)],
    ) -> Result<Fetched<(Url, Value)>, FetchError> {
        let url = self.request_url(method, extra)?;
        match self
            .upstream
            .get_json_checked(Service::Lastfm, url.clone(), HeaderMap::new(), check_api_error)
            .await?
        {
            Fetched::Fresh(value) => Ok(Fetched::Fresh((url, value))),
            Fetched::NotModified { url } => Ok(Fetched::NotModified { url }),
            Fetched::Cleared => Ok(Fetched::Cleared),
        }
    }

    async fn fetch_recent_tracks(&self, limit: u32) -> Result<Fetched<Vec<Track>>, FetchError> {
        match self
            .call("user.getrecenttracks", &[("limit", limit.to_string())])
            .await?
        {
            Fetched::Fresh((url, value)) => {
                let envelope: RecentTracksEnvelope = decode(&url, value)?;
                Ok(Fetched::Fresh(envelope.recenttracks.track))
            }
            Fetched::NotModified { url } => Ok(Fetched::NotModified { url }),
            Fetched::Cleared => Ok(Fetched::Cleared),
        }
    }

    async fn fetch_top_artists(
        &self,
        period: &str,
        limit: u32,
    ) -> Result<Fetched<Vec<Artist>>, FetchError> {
        let extra = [("period", period.to_string()), ("limit", limit.to_string())];
        match self.call("user.gettopartists", &extra).await? {
            Fetched::Fresh((url, value)) => {
                let envelope: TopArtistsEnvelope = decode(&url, value)?;
                Ok(Fetched::Fresh(envelope.topartists.artist))
            }
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

    /// Most recent scrobbles, newest first; a now-playing track leads.
    pub async fn recent_tracks(
        &self,
        scope: &CacheScope,
        limit: u32,
        options: GetOptions,
    ) -> Cached<Vec<Track>> {
        let key = self.key("lastfm_recent", &[("limit", limit.to_string())]);
        scope
            .get_or_set(
                &key,
                || self.fetch_recent_tracks(limit),
                RECENT_TRACKS_TTL,
                options.service(Service::Lastfm),
            )
            .await
    }

    pub async fn top_artists(
        &self,
        scope: &CacheScope,
        period: &str,
        limit: u32,
        options: GetOptions,
    ) -> Cached<Vec<Artist>> {
        let period = if PERIODS.contains(&period) {
            period
        } else {
            "overall"
        };
        let key = self.key(
            "lastfm_top_artists",
            &[("period", period.to_string()), ("limit", limit.to_string())],
        );
        scope
            .get_or_set(
                &key,
                || self.fetch_top_artists(period, limit),
                TOP_ARTISTS_TTL,
                options.service(Service::Lastfm),
            )
            .await
    }
}

#[async_trait]
impl Provider for LastfmClient {
    fn service(&self) -> Service {
        Service::Lastfm
    }

    fn is_configured(&self) -> bool {
        self.credentials().is_ok()
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let url = match self.request_url("user.getinfo", &[]) {
            Ok(url) => url,
            Err(FetchError::NotConfigured(_)) => {
                return ConnectionStatus::Warning(
                    "Last.fm API key or username is not set".to_string(),
                );
            }
            Err(e) => return ConnectionStatus::Error(e.to_string()),
        };

        match self
            .upstream
            .probe(Service::Lastfm, url, HeaderMap::new())
            .await
        {
            Ok(probe) => {
                if let Some(message) = probe.body.get("message").and_then(Value::as_str) {
                    return ConnectionStatus::Error(format!("Last.fm: {}", message));
                }
                match probe.body.pointer("/user/name").and_then(Value::as_str) {
                    Some(name) if probe.status == 200 => {
                        info!("Last.fm connection test succeeded for {}", name);
                        ConnectionStatus::Success(format!("Connected to Last.fm as {}", name))
                    }
                    _ => ConnectionStatus::Error(format!(
                        "Unexpected Last.fm response (HTTP {})",
                        probe.status
                    )),
                }
            }
            Err(e) => ConnectionStatus::Error(e.to_string()),
        }
    }
}
